use std::{io, time::Duration};

use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

pub fn confirm(prompt: &str) -> io::Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
}

/// Spinner shown on stderr while a validator compiles. Hidden when stderr is not a terminal.
pub struct Spinner {
    bar: ProgressBar,
    ticker: JoinHandle<()>,
}

impl Spinner {
    pub fn start(msg: impl Into<String>) -> Self {
        let bar = ProgressBar::new_spinner().with_message(msg.into());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            bar.set_style(style);
        }
        let ticking = bar.clone();
        let ticker = tokio::spawn(async move {
            while !ticking.is_finished() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ticking.tick();
            }
        });
        Self { bar, ticker }
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
        self.ticker.abort();
    }
}
