//! Message body rendering
//!
//! Merge tags and template storage live outside the engine; it only needs
//! something that turns a campaign and a recipient into a body.

use ember_store::{Campaign, Recipient};

use crate::error::RenderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub html: String,
    pub text: String,
}

pub trait Renderer: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// When the body cannot be built for this campaign.
    fn render(&self, campaign: &Campaign, recipient: &Recipient)
    -> Result<RenderedBody, RenderError>;
}

/// Placeholder body built from the subject line
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
    ) -> Result<RenderedBody, RenderError> {
        let greeting = recipient
            .name
            .as_deref()
            .map_or_else(|| "Hello,".to_string(), |name| format!("Hello {name},"));

        Ok(RenderedBody {
            html: format!(
                "<html><body><p>{greeting}</p><h1>{}</h1></body></html>",
                campaign.subject
            ),
            text: format!("{greeting}\n\n{}\n", campaign.subject),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ember_store::{AccountId, ListId};

    use super::*;

    #[test]
    fn test_plain_body_mentions_subject() {
        let campaign = Campaign::new(AccountId::generate(), ListId::generate(), "c", "Spring sale");
        let mut recipient = Recipient::new("jo@example.test");
        recipient.name = Some("Jo".to_string());

        let body = PlainRenderer.render(&campaign, &recipient).unwrap();
        assert!(body.html.contains("Spring sale"));
        assert!(body.text.starts_with("Hello Jo,"));
    }
}
