use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::process::Command;

use super::{Error, Mapper};
use crate::backend::RuleStore;
use crate::lock::Lock;

impl<S: RuleStore> Mapper<S> {
    /// Writes the whole live rule set to the rules file.
    pub async fn persist(&self) -> Result<PathBuf, Error> {
        let _lock = Lock::acquire(&self.settings.lock_file).await?;
        self.save_locked().await
    }

    pub(super) async fn save_locked(&self) -> Result<PathBuf, Error> {
        let dump = self.store.save().await?;
        let path = self.settings.rules_file.clone();

        write_replace(&path, dump.as_bytes())
            .await
            .map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;

        info!("saved rules to {}", path.display());

        if let Some(unit) = &self.settings.boot_unit {
            register_boot_unit(unit, &self.store.restore_program(), &path).await;
        }

        Ok(path)
    }
}

/// Replaces `path` without ever leaving it half written.
async fn write_replace(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|x| !x.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");

    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await
}

fn boot_unit(restore_program: &str, rules_file: &Path) -> String {
    format!(
        "\
[Unit]
Description=Restore NAT port mappings
DefaultDependencies=no
Before=network-pre.target
Wants=network-pre.target

[Service]
Type=oneshot
ExecStart={restore_program}
StandardInput=file:{rules}
RemainAfterExit=yes

[Install]
WantedBy=multi-user.target
",
        rules = rules_file.display()
    )
}

/// Creates and enables a unit that replays `rules_file` at boot, unless the
/// unit already exists.
async fn register_boot_unit(unit: &Path, restore_program: &str, rules_file: &Path) {
    if fs::try_exists(unit).await.unwrap_or(false) {
        trace!("{} already exists", unit.display());
        return;
    }

    if let Err(e) = fs::write(unit, boot_unit(restore_program, rules_file)).await {
        warn!("cannot create {}: {}", unit.display(), display!(e));
        return;
    }

    let Some(name) = unit.file_name() else {
        return;
    };

    let commands: [Vec<OsString>; 2] = [
        vec!["daemon-reload".into()],
        vec!["enable".into(), name.to_owned()],
    ];

    for args in commands {
        match Command::new("systemctl").args(&args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("systemctl {:?} exited with {status}", args),
            Err(e) => warn!("cannot run systemctl: {}", display!(e)),
        }
    }

    info!("rules will be restored at boot by {}", unit.display());
}
