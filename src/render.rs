use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("плейсхолдер '{{{0}}}' отсутствует в контексте")]
    MissingPlaceholder(String),
    #[error("непарная фигурная скобка в позиции {0}")]
    UnbalancedBrace(usize),
}

/// Values available to overlay templates at render time.
#[derive(Debug, Clone)]
pub struct RenderContext {
    values: Vec<(&'static str, String)>,
}

impl RenderContext {
    pub fn new(now: DateTime<Local>, device_name: &str, overlay_id: &str, channel: u32) -> Self {
        let values = vec![
            ("timestamp", now.format("%Y-%m-%d %H:%M:%S").to_string()),
            ("date", now.format("%Y-%m-%d").to_string()),
            ("time", now.format("%H:%M:%S").to_string()),
            ("camera_name", device_name.to_string()),
            ("device_name", device_name.to_string()),
            ("overlay_id", overlay_id.to_string()),
            ("resource_id", overlay_id.to_string()),
            ("channel", channel.to_string()),
        ];
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.iter().map(|(k, _)| *k)
    }
}

/// Substitutes `{name}` placeholders. `{{` and `}}` produce literal braces.
pub fn try_render(template: &str, ctx: &RenderContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    match k {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => return Err(RenderError::UnbalancedBrace(pos)),
                        _ => key.push(k),
                    }
                }
                if !closed {
                    return Err(RenderError::UnbalancedBrace(pos));
                }
                match ctx.get(&key) {
                    Some(value) => out.push_str(value),
                    None => return Err(RenderError::MissingPlaceholder(key)),
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(RenderError::UnbalancedBrace(pos));
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Character count before truncation, if truncation happened.
    pub truncated_from: Option<usize>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ContentRenderer {
    max_len: usize,
}

impl ContentRenderer {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Never fails: a template that cannot be rendered is sent literally,
    /// and text longer than the device accepts is cut to `max_len` characters.
    pub fn render(&self, template: &str, ctx: &RenderContext) -> Rendered {
        let (text, used_fallback) = match try_render(template, ctx) {
            Ok(text) => (text, false),
            Err(err) => {
                let available = ctx
                    .keys()
                    .map(|k| format!("{{{k}}}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(
                    device = ctx.get("device_name").unwrap_or_default(),
                    overlay = ctx.get("overlay_id").unwrap_or_default(),
                    error = %err,
                    available = %available,
                    "шаблон не отрендерен, используется исходный текст"
                );
                (template.to_string(), true)
            }
        };

        let len = text.chars().count();
        if len > self.max_len {
            warn!(
                device = ctx.get("device_name").unwrap_or_default(),
                overlay = ctx.get("overlay_id").unwrap_or_default(),
                from = len,
                to = self.max_len,
                "текст оверлея обрезан"
            );
            return Rendered {
                text: text.chars().take(self.max_len).collect(),
                truncated_from: Some(len),
                used_fallback,
            };
        }

        Rendered {
            text,
            truncated_from: None,
            used_fallback,
        }
    }
}
