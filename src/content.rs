use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;

/// First capacity guess is this many times the compressed size.
const SIZE_HINT_FACTOR: usize = 4;
const MIN_SIZE_HINT: usize = 4096;
const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Message type codes found in the `Type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    ContactCard,
    Video,
    Emoji,
    Location,
    App,
    Voip,
    System,
    SystemXml,
    Unknown(i64),
}

impl MessageKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Text,
            3 => Self::Image,
            34 => Self::Voice,
            42 => Self::ContactCard,
            43 => Self::Video,
            47 => Self::Emoji,
            48 => Self::Location,
            49 => Self::App,
            50 => Self::Voip,
            10000 => Self::System,
            10002 => Self::SystemXml,
            other => Self::Unknown(other),
        }
    }

    fn is_plain_text(self) -> bool {
        matches!(self, Self::Text | Self::System)
    }
}

/// Title, summary and link pulled out of an `<appmsg>` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CardExtract {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
}

impl CardExtract {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.summary.is_none() && self.link.is_none()
    }

    /// `title | summary`, or whichever of the two exists.
    pub fn display_text(&self) -> String {
        match (&self.title, &self.summary) {
            (Some(t), Some(s)) => format!("{t} | {s}"),
            (Some(t), None) => t.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedContent {
    pub text: String,
    pub card: Option<CardExtract>,
    /// Payload before interpretation (decompressed XML, or the original text).
    pub raw: String,
    pub decompression_failed: bool,
}

/// Resolve the display text of one record.
pub fn resolve_content(
    kind: MessageKind,
    text: Option<&str>,
    compressed: Option<&[u8]>,
) -> ResolvedContent {
    let original = text.unwrap_or_default();

    match kind {
        k if k.is_plain_text() => ResolvedContent {
            text: original.to_string(),
            raw: original.to_string(),
            ..Default::default()
        },
        MessageKind::App => resolve_app(original, compressed.filter(|b| !b.is_empty())),
        MessageKind::Unknown(_) => ResolvedContent {
            raw: original.to_string(),
            ..Default::default()
        },
        _ if looks_like_xml(original) => ResolvedContent {
            raw: original.to_string(),
            ..Default::default()
        },
        _ => ResolvedContent {
            text: original.to_string(),
            raw: original.to_string(),
            ..Default::default()
        },
    }
}

fn resolve_app(original: &str, compressed: Option<&[u8]>) -> ResolvedContent {
    let document = match compressed {
        Some(blob) => match decompress_block(blob) {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .to_string(),
            None => {
                return ResolvedContent {
                    text: original.to_string(),
                    raw: original.to_string(),
                    card: None,
                    decompression_failed: true,
                };
            }
        },
        None if looks_like_xml(original) => original.to_string(),
        None => {
            return ResolvedContent {
                text: original.to_string(),
                raw: original.to_string(),
                ..Default::default()
            };
        }
    };

    match extract_card(&document) {
        Some(card) => ResolvedContent {
            text: card.display_text(),
            card: (!card.is_empty()).then_some(card),
            raw: document,
            decompression_failed: false,
        },
        None => ResolvedContent {
            text: document.trim().to_string(),
            raw: document,
            card: None,
            decompression_failed: false,
        },
    }
}

/// Decompress a raw LZ4 block of unknown uncompressed size.
///
/// The capacity hint doubles until the block fits or the 16 MiB cap is
/// reached. A corrupt block fails at every size.
pub fn decompress_block(blob: &[u8]) -> Option<Vec<u8>> {
    let mut hint = (blob.len() * SIZE_HINT_FACTOR).max(MIN_SIZE_HINT);
    let mut last_error = None;
    while hint <= MAX_DECOMPRESSED_SIZE {
        match lz4_flex::block::decompress(blob, hint) {
            Ok(bytes) => return Some(bytes),
            Err(err) => {
                last_error = Some(err);
                hint *= 2;
            }
        }
    }
    if let Some(err) = last_error {
        tracing::debug!(error = %err, len = blob.len(), "lz4 block rejected");
    }
    None
}

pub fn looks_like_xml(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with("<?xml") || text.starts_with("<msg")
}

/// Pull `appmsg/{title,des|digest,url}` out of a card document.
///
/// Returns `None` when the document is not well-formed XML.
pub fn extract_card(xml: &str) -> Option<CardExtract> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut title = None;
    let mut des = None;
    let mut digest = None;
    let mut url = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok()?;
                capture(&stack, text, &mut title, &mut des, &mut digest, &mut url);
            }
            Ok(Event::CData(e)) => {
                let bytes = e.into_inner();
                let text = String::from_utf8_lossy(&bytes);
                capture(&stack, text, &mut title, &mut des, &mut digest, &mut url);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "card document is not well-formed");
                return None;
            }
        }
    }

    if !stack.is_empty() {
        return None;
    }

    Some(CardExtract {
        title,
        summary: des.or(digest),
        link: url,
    })
}

fn capture(
    stack: &[String],
    text: Cow<'_, str>,
    title: &mut Option<String>,
    des: &mut Option<String>,
    digest: &mut Option<String>,
    url: &mut Option<String>,
) {
    // Only direct children of <appmsg> directly under the document root.
    let [_, parent, leaf] = stack else {
        return;
    };
    if parent != "appmsg" {
        return;
    }
    let slot = match leaf.as_str() {
        "title" => title,
        "des" => des,
        "digest" => digest,
        "url" => url,
        _ => return,
    };
    let text = text.trim();
    if slot.is_none() && !text.is_empty() {
        *slot = Some(text.to_string());
    }
}
