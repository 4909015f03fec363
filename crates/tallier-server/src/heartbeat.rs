/// Harold heartbeat client.
///
/// After each successful graphite send the master reports liveness to
/// harold with a TTL of three flush intervals; a missed TTL is harold's
/// cue to page. Failures here are logged by the caller and never affect
/// the flush cycle.

use std::time::Duration;

pub struct HaroldClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HaroldClient {
    pub fn new(base_url: &str, secret: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        }
    }

    pub async fn heartbeat(&self, tag: &str, interval_secs: u64) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/harold/heartbeat", self.base_url))
            .form(&[
                ("secret", self.secret.as_str()),
                ("tag", tag),
                ("interval", &interval_secs.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
