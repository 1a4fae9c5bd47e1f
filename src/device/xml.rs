use crate::device::{Position, PushError};
use quick_xml::escape::escape;
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};

pub const XML_NAMESPACE: &str = "http://www.hikvision.com/ver20/XMLSchema";

/// Minimal `TextOverlay` document for the fast path.
pub fn minimal_overlay(overlay_id: &str, enabled: bool, text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <TextOverlay version=\"2.0\" xmlns=\"{XML_NAMESPACE}\">\n    \
         <id>{}</id>\n    \
         <enabled>{}</enabled>\n    \
         <displayText>{}</displayText>\n\
         </TextOverlay>",
        escape(overlay_id),
        enabled,
        escape(text)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    DisplayText,
    Enabled,
    PositionX,
    PositionY,
}

impl Field {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"displayText" => Some(Field::DisplayText),
            b"enabled" => Some(Field::Enabled),
            b"positionX" => Some(Field::PositionX),
            b"positionY" => Some(Field::PositionY),
            _ => None,
        }
    }
}

struct Replacements<'a> {
    text: &'a str,
    enabled: &'a str,
    x: Option<&'a str>,
    y: Option<&'a str>,
}

impl<'a> Replacements<'a> {
    fn get(&self, field: Field) -> Option<&'a str> {
        match field {
            Field::DisplayText => Some(self.text),
            Field::Enabled => Some(self.enabled),
            Field::PositionX => self.x,
            Field::PositionY => self.y,
        }
    }
}

/// Rewrites a fetched overlay document in place, keeping every element
/// it does not own (namespace, geometry, font settings).
pub fn rewrite_overlay(
    fetched: &str,
    text: &str,
    enabled: bool,
    position: Position,
) -> Result<String, PushError> {
    let enabled = enabled.to_string();
    let x = position.x.map(|v| v.to_string());
    let y = position.y.map(|v| v.to_string());
    let values = Replacements {
        text,
        enabled: &enabled,
        x: x.as_deref(),
        y: y.as_deref(),
    };

    let mut reader = Reader::from_str(fetched);
    let mut writer = Writer::new(Vec::with_capacity(fetched.len() + text.len()));
    let mut replacing = false;
    let mut saw_display_text = false;
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| PushError::MalformedResponse(err.to_string()))?;
        match event {
            Event::Start(start) => {
                saw_root = true;
                let field = Field::from_local_name(start.local_name().as_ref());
                write(&mut writer, Event::Start(start))?;
                if let Some(value) = field.and_then(|f| values.get(f)) {
                    if field == Some(Field::DisplayText) {
                        saw_display_text = true;
                    }
                    write(&mut writer, Event::Text(BytesText::new(value)))?;
                    replacing = true;
                }
            }
            Event::Empty(empty) => {
                saw_root = true;
                let field = Field::from_local_name(empty.local_name().as_ref());
                match field.and_then(|f| values.get(f)) {
                    Some(value) => {
                        if field == Some(Field::DisplayText) {
                            saw_display_text = true;
                        }
                        let end = empty.to_end().into_owned();
                        write(&mut writer, Event::Start(empty.clone()))?;
                        write(&mut writer, Event::Text(BytesText::new(value)))?;
                        write(&mut writer, Event::End(end))?;
                    }
                    None => write(&mut writer, Event::Empty(empty))?,
                }
            }
            Event::Text(_) | Event::CData(_) if replacing => {}
            Event::End(end) => {
                replacing = false;
                write(&mut writer, Event::End(end))?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    if !saw_root {
        return Err(PushError::MalformedResponse(
            "пустой XML-документ".to_string(),
        ));
    }
    if !saw_display_text {
        return Err(PushError::MalformedResponse(
            "элемент displayText не найден".to_string(),
        ));
    }

    String::from_utf8(writer.into_inner())
        .map_err(|err| PushError::MalformedResponse(err.to_string()))
}

/// Ids of every `TextOverlay` in a channel overlay listing.
pub fn overlay_ids(document: &str) -> Result<Vec<String>, PushError> {
    let mut reader = Reader::from_str(document);
    let mut ids = Vec::new();
    // depth below the current TextOverlay element, None outside of one
    let mut depth: Option<usize> = None;
    let mut reading_id = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| PushError::MalformedResponse(err.to_string()))?;
        match event {
            Event::Start(start) => {
                let name = start.local_name();
                depth = match depth {
                    None if name.as_ref() == b"TextOverlay" => Some(0),
                    None => None,
                    Some(d) => {
                        reading_id = d == 0 && name.as_ref() == b"id";
                        Some(d + 1)
                    }
                };
            }
            Event::Text(text) if reading_id => {
                let id = text
                    .unescape()
                    .map_err(|err| PushError::MalformedResponse(err.to_string()))?;
                let id = id.trim();
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
            Event::End(_) => {
                reading_id = false;
                depth = match depth {
                    Some(0) | None => None,
                    Some(d) => Some(d - 1),
                };
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ids)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), PushError> {
    writer
        .write_event(event)
        .map_err(|err| PushError::MalformedResponse(err.to_string()))
}
