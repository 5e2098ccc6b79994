use std::io;
use std::path::Path;

use tokio::fs;

use crate::config::Settings;

const KEY: &str = "net.ipv4.ip_forward";

/// Turns on IPv4 forwarding now and on every boot. Failures are logged, the
/// rules are still written.
pub async fn enable(settings: &Settings) {
    if let Err(e) = enable_now(&settings.ip_forward_file).await {
        warn!(
            "cannot enable IP forwarding through {}: {}",
            settings.ip_forward_file.display(),
            display!(e)
        );
    }

    if let Err(e) = enable_on_boot(&settings.sysctl_file).await {
        warn!(
            "cannot persist IP forwarding in {}: {}",
            settings.sysctl_file.display(),
            display!(e)
        );
    }
}

async fn enable_now(path: &Path) -> io::Result<()> {
    let current = fs::read_to_string(path).await.unwrap_or_default();
    if current.trim() == "1" {
        return Ok(());
    }

    fs::write(path, "1\n").await?;
    info!("enabled IP forwarding");
    Ok(())
}

async fn enable_on_boot(path: &Path) -> io::Result<()> {
    let current = match fs::read_to_string(path).await {
        Ok(x) => x,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    if let Some(updated) = with_forwarding(&current) {
        fs::write(path, updated).await?;
        debug!("set {KEY}=1 in {}", path.display());
    }

    Ok(())
}

/// `conf` with forwarding enabled, or `None` if it already is.
fn with_forwarding(conf: &str) -> Option<String> {
    let mut seen = false;
    let mut changed = false;
    let mut out = String::with_capacity(conf.len() + KEY.len() + 3);

    for line in conf.lines() {
        let setting = line
            .split_once('=')
            .filter(|_| !line.trim_start().starts_with(['#', ';']))
            .map(|(key, value)| (key.trim().replace('/', "."), value.trim()));

        match setting {
            Some((key, value)) if key == KEY => {
                seen = true;
                if value == "1" {
                    out.push_str(line);
                } else {
                    changed = true;
                    out.push_str(KEY);
                    out.push_str("=1");
                }
            }
            _ => out.push_str(line),
        }

        out.push('\n');
    }

    if !seen {
        changed = true;
        out.push_str(KEY);
        out.push_str("=1\n");
    }

    changed.then_some(out)
}
