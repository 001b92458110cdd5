// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Minimal XML property-list parser.
//!
//! CoreStorage embeds small XML plists in its metadata: a root `<dict>` of
//! `<key>`/value pairs where values are dicts, arrays, strings, integers or
//! base64 `<data>` blobs. This parser covers exactly that subset with no DTD
//! handling and no external entities; only the five XML built-in entities
//! are recognized.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A parsed plist value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Dict(Vec<(String, Value)>),
    Array(Vec<Value>),
    String(String),
    Integer(i64),
    Data(Vec<u8>),
}

impl Value {
    /// Looks up a dict entry by key name
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// The string payload, if this is a string value
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The decoded data payload, if this is a data value
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The array elements, if this is an array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(elements) => Some(elements),
            _ => None,
        }
    }

    /// Interprets a string value as a UUID and returns its big-endian bytes
    pub fn as_uuid(&self) -> Option<[u8; 16]> {
        let text = self.as_string()?;
        Uuid::parse_str(text).ok().map(|uuid| *uuid.as_bytes())
    }
}

/// Parses a plist document.
///
/// The input may carry an XML declaration, a DOCTYPE line and a `<plist>`
/// wrapper, or start directly at the root `<dict>`. Trailing NUL bytes are
/// tolerated; the embedded metadata plists are NUL-terminated.
pub fn parse(data: &[u8]) -> Result<Value> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = std::str::from_utf8(&data[..end]).map_err(|_| Error::Malformed {
        what: "plist is not valid UTF-8",
    })?;
    let mut parser = Parser { text, offset: 0 };

    parser.skip_prolog()?;
    let mut wrapped = false;
    if parser.peek_tag()?.name == "plist" {
        parser.next_tag()?;
        wrapped = true;
    }
    let value = parser.parse_value()?;
    if wrapped {
        parser.expect_close("plist")?;
    }
    Ok(value)
}

struct Tag<'a> {
    name: &'a str,
    closing: bool,
    self_closing: bool,
}

struct Parser<'a> {
    text: &'a str,
    offset: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.offset..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.offset = self.text.len() - trimmed.len();
    }

    fn skip_prolog(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if let Some(stripped) = rest.strip_prefix("<?") {
                let end = stripped.find("?>").ok_or(Error::Malformed {
                    what: "unterminated XML declaration",
                })?;
                self.offset += 2 + end + 2;
            } else if let Some(stripped) = rest.strip_prefix("<!") {
                let end = stripped.find('>').ok_or(Error::Malformed {
                    what: "unterminated DOCTYPE",
                })?;
                self.offset += 2 + end + 1;
            } else {
                return Ok(());
            }
        }
    }

    /// Reads the next tag without consuming it
    fn peek_tag(&mut self) -> Result<Tag<'a>> {
        let saved = self.offset;
        let tag = self.next_tag()?;
        self.offset = saved;
        Ok(tag)
    }

    fn next_tag(&mut self) -> Result<Tag<'a>> {
        self.skip_whitespace();
        let rest = self.rest();
        if !rest.starts_with('<') {
            return Err(Error::Malformed {
                what: "expected an XML tag",
            });
        }
        let end = rest.find('>').ok_or(Error::Malformed {
            what: "unterminated XML tag",
        })?;
        let mut inner = &rest[1..end];
        let closing = inner.starts_with('/');
        if closing {
            inner = &inner[1..];
        }
        let self_closing = inner.ends_with('/');
        if self_closing {
            inner = &inner[..inner.len() - 1];
        }
        // Attributes (as on <plist version="1.0">) are ignored.
        let name = inner.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(Error::Malformed {
                what: "empty XML tag name",
            });
        }
        self.offset += end + 1;
        Ok(Tag {
            name,
            closing,
            self_closing,
        })
    }

    /// Consumes text up to the next `<`, decoding built-in entities
    fn text_content(&mut self) -> Result<String> {
        let rest = self.rest();
        let end = rest.find('<').ok_or(Error::Malformed {
            what: "unterminated text content",
        })?;
        let raw = &rest[..end];
        self.offset += end;
        decode_entities(raw)
    }

    fn expect_close(&mut self, name: &str) -> Result<()> {
        let tag = self.next_tag()?;
        if !tag.closing || tag.name != name {
            return Err(Error::Malformed {
                what: "mismatched closing tag",
            });
        }
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value> {
        let tag = self.next_tag()?;
        if tag.closing {
            return Err(Error::Malformed {
                what: "unexpected closing tag",
            });
        }
        match tag.name {
            "dict" => {
                if tag.self_closing {
                    return Ok(Value::Dict(Vec::new()));
                }
                self.parse_dict_body()
            }
            "array" => {
                if tag.self_closing {
                    return Ok(Value::Array(Vec::new()));
                }
                self.parse_array_body()
            }
            "string" => {
                if tag.self_closing {
                    return Ok(Value::String(String::new()));
                }
                let content = self.text_content()?;
                self.expect_close("string")?;
                Ok(Value::String(content))
            }
            "integer" => {
                if tag.self_closing {
                    return Err(Error::Malformed {
                        what: "empty integer value",
                    });
                }
                let content = self.text_content()?;
                self.expect_close("integer")?;
                let value = content.trim().parse::<i64>().map_err(|_| Error::Malformed {
                    what: "non-numeric integer value",
                })?;
                Ok(Value::Integer(value))
            }
            "data" => {
                if tag.self_closing {
                    return Ok(Value::Data(Vec::new()));
                }
                let content = self.text_content()?;
                self.expect_close("data")?;
                let stripped: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = BASE64.decode(stripped).map_err(|_| Error::Malformed {
                    what: "invalid base64 in data value",
                })?;
                Ok(Value::Data(bytes))
            }
            _ => Err(Error::Malformed {
                what: "unrecognized plist value tag",
            }),
        }
    }

    fn parse_dict_body(&mut self) -> Result<Value> {
        let mut entries = Vec::new();
        loop {
            let tag = self.next_tag()?;
            if tag.closing {
                if tag.name != "dict" {
                    return Err(Error::Malformed {
                        what: "mismatched dict closing tag",
                    });
                }
                return Ok(Value::Dict(entries));
            }
            if tag.name != "key" {
                return Err(Error::Malformed {
                    what: "dict entry without a key",
                });
            }
            let key = if tag.self_closing {
                String::new()
            } else {
                let key = self.text_content()?;
                self.expect_close("key")?;
                key
            };
            let value = self.parse_value()?;
            entries.push((key, value));
        }
    }

    fn parse_array_body(&mut self) -> Result<Value> {
        let mut elements = Vec::new();
        loop {
            let tag = self.peek_tag()?;
            if tag.closing {
                self.expect_close("array")?;
                return Ok(Value::Array(elements));
            }
            elements.push(self.parse_value()?);
        }
    }
}

fn decode_entities(raw: &str) -> Result<String> {
    if !raw.contains('&') {
        return Ok(raw.to_owned());
    }
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(position) = rest.find('&') {
        decoded.push_str(&rest[..position]);
        rest = &rest[position..];
        let end = rest.find(';').ok_or(Error::Malformed {
            what: "unterminated XML entity",
        })?;
        decoded.push(match &rest[..=end] {
            "&lt;" => '<',
            "&gt;" => '>',
            "&amp;" => '&',
            "&apos;" => '\'',
            "&quot;" => '"',
            _ => {
                return Err(Error::Malformed {
                    what: "unrecognized XML entity",
                });
            }
        });
        rest = &rest[end + 1..];
    }
    decoded.push_str(rest);
    Ok(decoded)
}
