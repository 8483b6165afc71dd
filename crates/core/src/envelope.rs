/// Raw webhook delivery as received from the HTTP layer.
///
/// The envelope is never mutated after construction; verification and
/// normalization only borrow it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebhookEnvelope {
    body: Vec<u8>,
    signature: Option<String>,
    timestamp: Option<String>,
    content_type: Option<String>,
}

impl WebhookEnvelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Header-supplied signature, if any. Blank values count as absent.
    pub fn signature(&self) -> Option<&str> {
        self.signature
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns `true` when the body was sent as an HTML form.
    pub fn is_form_encoded(&self) -> bool {
        self.content_type()
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_signature_is_treated_as_missing() {
        let envelope = WebhookEnvelope::new(b"{}".to_vec()).with_signature("   ");
        assert_eq!(envelope.signature(), None);
    }

    #[test]
    fn detects_form_encoding_with_charset() {
        let envelope = WebhookEnvelope::new(b"id=1".to_vec())
            .with_content_type("application/x-www-form-urlencoded; charset=utf-8");
        assert!(envelope.is_form_encoded());
        assert!(!WebhookEnvelope::new(b"{}".to_vec())
            .with_content_type("application/json")
            .is_form_encoded());
    }
}
