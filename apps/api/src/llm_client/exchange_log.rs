//! Exchange archive — uploads every prompt and reply to S3 for later inspection.
//!
//! Layout: `exchanges/<YYYY-MM-DD>/<exchange uuid>/request.txt|reply.txt`.
//! Upload errors are logged and never fail a call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ClientError, TextGenerationClient};

pub struct ArchivedClient {
    inner: Arc<dyn TextGenerationClient>,
    s3: aws_sdk_s3::Client,
    bucket: String,
}

impl ArchivedClient {
    pub fn new(inner: Arc<dyn TextGenerationClient>, s3: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { inner, s3, bucket }
    }

    async fn upload(&self, key: &str, body: &str) {
        let result = self
            .s3
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .content_type("text/plain; charset=utf-8")
            .send()
            .await;

        match result {
            Ok(_) => info!("Archived exchange text to s3://{}/{}", self.bucket, key),
            Err(e) => warn!("Exchange archive upload failed for {key}: {e}"),
        }
    }
}

/// Key prefix of one exchange.
pub fn exchange_prefix(at: DateTime<Utc>, exchange_id: Uuid) -> String {
    format!("exchanges/{}/{}", at.format("%Y-%m-%d"), exchange_id)
}

#[async_trait]
impl TextGenerationClient for ArchivedClient {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, ClientError> {
        let prefix = exchange_prefix(Utc::now(), Uuid::new_v4());
        self.upload(&format!("{prefix}/request.txt"), prompt).await;

        let result = self.inner.execute(prompt, timeout).await;
        match &result {
            Ok(reply) => self.upload(&format!("{prefix}/reply.txt"), reply).await,
            Err(e) => self.upload(&format!("{prefix}/error.txt"), &e.to_string()).await,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_exchange_prefix_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap();
        let id = Uuid::nil();
        assert_eq!(
            exchange_prefix(at, id),
            "exchanges/2024-03-09/00000000-0000-0000-0000-000000000000"
        );
    }
}
