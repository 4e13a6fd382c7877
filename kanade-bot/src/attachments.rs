//! Attachment download.

use crate::message::Attachment;
use crate::traits::{AttachmentReader, ChannelError, ChannelResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Downloads attachments over HTTP.
pub struct HttpAttachmentReader {
    client: Client,
}

impl HttpAttachmentReader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

impl Default for HttpAttachmentReader {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl AttachmentReader for HttpAttachmentReader {
    async fn read(&self, attachment: &Attachment) -> ChannelResult<Vec<u8>> {
        let resp = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Attachment download failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::InvalidMessage(format!(
                "Attachment {} returned {status}",
                attachment.filename
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Connection(format!("Attachment read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn attachment(url: String) -> Attachment {
        Attachment {
            url,
            filename: "cat.png".into(),
            content_type: Some("image/png".into()),
            size_bytes: Some(4),
        }
    }

    #[tokio::test]
    async fn reads_attachment_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attachments/cat.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4]))
            .mount(&server)
            .await;

        let reader = HttpAttachmentReader::default();
        let bytes = reader
            .read(&attachment(format!("{}/attachments/cat.png", server.uri())))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn missing_attachment_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let reader = HttpAttachmentReader::default();
        let result = reader
            .read(&attachment(format!("{}/attachments/gone.png", server.uri())))
            .await;
        assert!(matches!(result, Err(ChannelError::InvalidMessage(_))));
    }
}
