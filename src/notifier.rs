use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{multipart, Client, Response};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tracing::warn;

use crate::config::NotificationSettings;

/// Outbound alert transport. Retries transient failures with exponential
/// back-off; a 429 waits out the server-provided interval without burning a
/// retry.
pub struct TelegramNotifier {
    base: String,
    chat_id: String,
    max_retries: u32,
    backoff_base: f64,
    retry_after_default: u64,
    client: Client,
}

impl TelegramNotifier {
    pub fn from_env(cfg: &NotificationSettings) -> Result<Self> {
        let token = std::env::var(&cfg.bot_token_env).unwrap_or_default();
        let chat_id = std::env::var(&cfg.chat_id_env).unwrap_or_default();
        if token.trim().is_empty() || chat_id.trim().is_empty() {
            bail!(
                "missing {} or {} in environment",
                cfg.bot_token_env,
                cfg.chat_id_env
            );
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .build()
            .context("building http client")?;
        Ok(Self {
            base: format!("https://api.telegram.org/bot{}", token.trim()),
            chat_id: chat_id.trim().to_string(),
            max_retries: cfg.max_retries,
            backoff_base: cfg.retry_backoff_base_sec,
            retry_after_default: cfg.retry_after_default_sec,
            client,
        })
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.base);
        self.execute("sendMessage", || {
            self.client
                .post(&url)
                .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
                .send()
                .map_err(Into::into)
        })
    }

    pub fn send_photo(&self, photo_path: &Path, caption: Option<&str>) -> Result<()> {
        let url = format!("{}/sendPhoto", self.base);
        self.execute("sendPhoto", || {
            let mut form = multipart::Form::new()
                .text("chat_id", self.chat_id.clone())
                .file("photo", photo_path)
                .with_context(|| format!("reading photo {}", photo_path.display()))?;
            if let Some(caption) = caption {
                form = form.text("caption", caption.to_string());
            }
            self.client.post(&url).multipart(form).send().map_err(Into::into)
        })
    }

    fn execute<F>(&self, what: &str, send: F) -> Result<()>
    where
        F: Fn() -> Result<Response>,
    {
        let mut attempts = 0u32;
        loop {
            let error = match send() {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after_secs(&resp).unwrap_or(self.retry_after_default);
                    warn!(what, wait_sec = wait, "telegram rate limited");
                    thread::sleep(Duration::from_secs(wait));
                    continue; // does not count against max_retries
                }
                Ok(resp) => anyhow!("telegram {what} returned HTTP {}", resp.status()),
                Err(e) => e,
            };

            attempts += 1;
            if attempts > self.max_retries {
                return Err(error.context(format!("telegram {what} failed after {attempts} attempts")));
            }
            let backoff = self.backoff_base.powi(attempts as i32);
            warn!(what, attempt = attempts, backoff_sec = backoff, error = %error, "telegram send retrying");
            thread::sleep(Duration::from_secs_f64(backoff));
        }
    }
}

fn retry_after_secs(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|s| s.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_requires_both_credentials() {
        let cfg = NotificationSettings {
            bot_token_env: "FACEWATCH_TEST_TOKEN_UNSET".to_string(),
            chat_id_env: "FACEWATCH_TEST_CHAT_UNSET".to_string(),
            ..NotificationSettings::default()
        };
        let err = TelegramNotifier::from_env(&cfg).unwrap_err().to_string();
        assert!(err.contains("FACEWATCH_TEST_TOKEN_UNSET"));
    }
}
