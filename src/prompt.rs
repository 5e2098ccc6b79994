use std::io::{self, BufRead};
use std::thread;

use tokio::io::{AsyncWriteExt, stdout};
use tokio::sync::mpsc;

/// Line-based operator input.
pub trait Prompt {
    /// Shows `question` and reads one line. `None` means input has ended.
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>>;
}

/// Reads stdin on a plain thread so that a pending read never holds up
/// runtime shutdown.
pub struct Terminal {
    lines: Option<mpsc::Receiver<io::Result<String>>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self { lines: None }
    }

    fn lines(&mut self) -> &mut mpsc::Receiver<io::Result<String>> {
        self.lines.get_or_insert_with(spawn_reader)
    }
}

fn spawn_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(1);

    let spawned = thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });

    // the sender went down with the closure, so reads see end of input
    if let Err(e) = spawned {
        warn!("cannot read from stdin: {}", display!(e));
    }

    rx
}

impl Prompt for Terminal {
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        let mut out = stdout();
        out.write_all(question.as_bytes()).await?;
        out.flush().await?;

        match self.lines().recv().await {
            Some(line) => line.map(|x| Some(x.trim().to_owned())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub mod scripted {
    use std::collections::VecDeque;
    use std::io;

    use super::Prompt;

    /// Answers questions from a fixed list, then reports end of input.
    #[derive(Debug, Default)]
    pub struct Scripted {
        answers: VecDeque<String>,
        pub asked: Vec<String>,
        stall: bool,
    }

    impl Scripted {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|x| x.to_string()).collect(),
                ..Default::default()
            }
        }

        /// Like [`Scripted::new`], but once the answers run out the operator
        /// never types anything again.
        pub fn stalling(answers: &[&str]) -> Self {
            Self {
                stall: true,
                ..Self::new(answers)
            }
        }
    }

    impl Prompt for Scripted {
        async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
            self.asked.push(question.to_owned());

            match self.answers.pop_front() {
                None if self.stall => std::future::pending().await,
                x => Ok(x),
            }
        }
    }
}
