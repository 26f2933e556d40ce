use super::attachment::OCTET_STREAM;
use super::{MailContent, TransportError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::{Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart};
use lettre::Message;

/// Builds a `multipart/mixed` message: an HTML part followed by one
/// base64 part per attachment. lettre generates the boundary.
///
/// The HTML part is sent as 8bit so the body goes out byte for byte; lettre
/// only falls back to another encoding for lines too long for SMTP.
pub fn build_message(to: &[String], content: &MailContent<'_>) -> Result<Message, TransportError> {
    if to.is_empty() {
        return Err(TransportError::NoRecipients);
    }

    let mut builder = Message::builder()
        .from(content.from.clone())
        .subject(content.subject);
    for address in to {
        builder = builder.to(address.parse::<Mailbox>()?);
    }

    let html = SinglePart::builder()
        .header(ContentType::TEXT_HTML)
        .header(ContentTransferEncoding::EightBit)
        .body(content.html_body.to_string());
    let mut parts = MultiPart::mixed().singlepart(html);
    for attachment in content.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .or_else(|_| ContentType::parse(OCTET_STREAM))
            .map_err(|e| TransportError::InvalidAttachment {
                filename: attachment.filename.clone(),
                reason: e.to_string(),
            })?;
        parts = parts.singlepart(
            AttachmentPart::new(attachment.filename.clone())
                .body(attachment.data.clone(), content_type),
        );
    }

    Ok(builder.multipart(parts)?)
}

/// The whole RFC 5322 message in URL-safe base64, as the `raw` field wants it.
pub fn encode_raw(message: &Message) -> String {
    URL_SAFE_NO_PAD.encode(message.formatted())
}
