//! Incremental scrubber for internal control tags in streamed model text.
//!
//! Two states: outside a tag, text is emitted except for a suffix that could
//! still turn into an opening tag; inside a tag, everything is dropped until
//! the matching closing tag. The held suffix never exceeds [`TAIL_CAP`].

use regex::Regex;

/// Tags whose bodies must never reach rendered text.
pub const DEFAULT_CONTROL_TAGS: &[&str] = &[
    "system-reminder",
    "system_notification",
    "tool_call",
    "tool_result",
    "function_calls",
    "thinking",
];

pub const TAIL_CAP: usize = 256;

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Found {
        start: usize,
        end: usize,
        tag: usize,
        self_closing: bool,
    },
    Partial {
        start: usize,
    },
    Nothing,
}

#[derive(Debug)]
pub struct ProtocolMarkupFilter {
    tags: Vec<String>,
    /// Index into `tags` while inside an open, unclosed tag.
    active: Option<usize>,
    tail: String,
    inline: Option<Regex>,
}

impl Default for ProtocolMarkupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_TAGS.iter().copied())
    }
}

impl ProtocolMarkupFilter {
    pub fn new<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let tags: Vec<String> = tags
            .into_iter()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            inline: inline_pattern(&tags),
            tags,
            active: None,
            tail: String::new(),
        }
    }

    pub fn is_inside_tag(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_tag(&self) -> Option<&str> {
        self.active.map(|idx| self.tags[idx].as_str())
    }

    /// Feeds one chunk and returns whatever is safe to show now.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut buf = std::mem::take(&mut self.tail);
        buf.push_str(chunk);
        let mut out = String::new();

        loop {
            match self.active {
                None => match self.scan_open(&buf) {
                    Scan::Found {
                        start,
                        end,
                        tag,
                        self_closing,
                    } => {
                        out.push_str(&buf[..start]);
                        if !self_closing {
                            self.active = Some(tag);
                        }
                        buf.drain(..end);
                    }
                    Scan::Partial { start } => {
                        out.push_str(&buf[..start]);
                        self.tail = buf.split_off(start);
                        break;
                    }
                    Scan::Nothing => {
                        out.push_str(&buf);
                        break;
                    }
                },
                Some(tag) => match scan_close(&buf, &self.tags[tag]) {
                    Scan::Found { end, .. } => {
                        self.active = None;
                        buf.drain(..end);
                    }
                    Scan::Partial { start } if buf.len() - start <= TAIL_CAP => {
                        self.tail = buf.split_off(start);
                        break;
                    }
                    _ => break,
                },
            }
        }

        self.strip_inline(&out)
    }

    /// End of stream. Content of an unterminated tag is discarded, never emitted.
    pub fn flush(&mut self) -> String {
        let tail = std::mem::take(&mut self.tail);
        if self.active.take().is_some() {
            return String::new();
        }
        self.strip_inline(&tail)
    }

    fn strip_inline(&self, text: &str) -> String {
        match &self.inline {
            Some(inline) if !text.is_empty() => inline.replace_all(text, "").into_owned(),
            _ => text.to_string(),
        }
    }

    fn scan_open(&self, buf: &str) -> Scan {
        let mut search = 0;
        while let Some(rel) = buf[search..].find('<') {
            let start = search + rel;
            let rest = &buf[start + 1..];
            let within_cap = buf.len() - start <= TAIL_CAP;

            for (idx, name) in self.tags.iter().enumerate() {
                if rest.len() < name.len() {
                    if within_cap && name.starts_with(rest) {
                        return Scan::Partial { start };
                    }
                    continue;
                }
                if !rest.starts_with(name.as_str()) {
                    continue;
                }
                let after = &rest[name.len()..];
                match after.chars().next() {
                    None if within_cap => return Scan::Partial { start },
                    Some(c) if c == '>' || c == '/' || c.is_whitespace() => match after.find('>') {
                        Some(gt) => {
                            return Scan::Found {
                                start,
                                end: start + 1 + name.len() + gt + 1,
                                tag: idx,
                                self_closing: after[..gt].trim_end().ends_with('/'),
                            }
                        }
                        None if within_cap => return Scan::Partial { start },
                        None => {}
                    },
                    _ => {}
                }
            }
            search = start + 1;
        }
        Scan::Nothing
    }
}

fn scan_close(buf: &str, name: &str) -> Scan {
    let pattern = format!("</{name}");
    let mut search = 0;
    while let Some(rel) = buf[search..].find('<') {
        let start = search + rel;
        let rest = &buf[start..];
        if rest.len() < pattern.len() {
            if pattern.starts_with(rest) {
                return Scan::Partial { start };
            }
        } else if rest.starts_with(&pattern) {
            let after = &rest[pattern.len()..];
            let trimmed = after.trim_start();
            if trimmed.starts_with('>') {
                return Scan::Found {
                    start,
                    end: start + pattern.len() + (after.len() - trimmed.len()) + 1,
                    tag: 0,
                    self_closing: false,
                };
            }
            if trimmed.is_empty() {
                return Scan::Partial { start };
            }
        }
        search = start + 1;
    }
    Scan::Nothing
}

/// Self-contained `<tag ...>...</tag>`, `<tag/>` and orphan closing tags.
fn inline_pattern(tags: &[String]) -> Option<Regex> {
    if tags.is_empty() {
        return None;
    }
    let mut alternatives: Vec<String> = tags
        .iter()
        .map(|tag| {
            let tag = regex::escape(tag);
            format!(r"<{tag}(?:\s[^>]*)?>.*?</{tag}\s*>")
        })
        .collect();
    let names = tags
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    alternatives.push(format!(r"<(?:{names})(?:\s[^>]*)?/>"));
    alternatives.push(format!(r"</(?:{names})\s*>"));
    Regex::new(&format!("(?s){}", alternatives.join("|"))).ok()
}
