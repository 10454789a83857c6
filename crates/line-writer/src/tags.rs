// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use tracing::debug;

use crate::point::escape_key;

/// Tags merged into every record when it is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultTags {
    tags: BTreeMap<String, String>,
}

impl DefaultTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tags: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parses `key=value` pairs separated by commas or whitespace. Malformed pairs are
    /// skipped.
    pub fn parse(raw: &str) -> Self {
        let mut tags = BTreeMap::new();
        let normalized = raw.replace(',', " ");
        for kv in normalized.split_whitespace() {
            match kv.split_once('=') {
                Some((k, v)) if !k.is_empty() && !v.is_empty() && !v.contains('=') => {
                    tags.insert(k.to_string(), v.to_string());
                }
                _ => debug!("Ignoring malformed default tag {kv:?}"),
            }
        }
        Self { tags }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Merges the default tags into a raw protocol line.
    ///
    /// Tags already present on the line win. Missing ones are appended to the series key.
    /// Blank lines, comments and lines without a field section are returned unchanged.
    pub fn apply(&self, line: &str) -> String {
        if self.tags.is_empty() {
            return line.to_string();
        }
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return line.to_string();
        }
        let offset = line.len() - trimmed.len();
        let Some(key_end) = find_unescaped(trimmed, ' ') else {
            return line.to_string();
        };
        let series_key = &trimmed[..key_end];
        let present: Vec<&str> = split_unescaped(series_key, ',')
            .into_iter()
            .skip(1)
            .map(|tag| find_unescaped(tag, '=').map_or(tag, |i| &tag[..i]))
            .collect();

        let mut merged = String::with_capacity(line.len() + 16 * self.tags.len());
        merged.push_str(&line[..offset + key_end]);
        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            let key = escape_key(key);
            if present.contains(&key.as_str()) {
                continue;
            }
            merged.push(',');
            merged.push_str(&key);
            merged.push('=');
            merged.push_str(&escape_key(value));
        }
        merged.push_str(&trimmed[key_end..]);
        merged
    }
}

/// Byte offset of the first `needle` not preceded by a backslash.
fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == needle {
            return Some(i);
        }
    }
    None
}

fn split_unescaped(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(i) = find_unescaped(rest, separator) {
        parts.push(&rest[..i]);
        rest = &rest[i + separator.len_utf8()..];
    }
    parts.push(rest);
    parts
}
