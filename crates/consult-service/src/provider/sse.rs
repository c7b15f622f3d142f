//! Server-sent events decoding for streamed chat completions.

use serde::{Deserialize, Serialize};

use consult_core::ChatUsage;

use super::ProviderError;

/// One decoded chunk of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Text delta, if the chunk carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Cumulative usage, usually only on the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

impl From<WireUsage> for ChatUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_units: usage.prompt_tokens,
            completion_units: usage.completion_tokens,
            total_units: usage.total_tokens,
        }
    }
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line terminates an event, so chunk boundaries
/// (including ones that split a UTF-8 sequence) do not matter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel was seen.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk and return every event it completed.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Decode` for malformed JSON and
    /// `ProviderError::Upstream` when the provider streams an error object.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ChatEvent>, ProviderError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(block) = self.next_block() {
            if let Some(event) = self.parse_block(&block)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Decode whatever remains once the body has ended.
    ///
    /// # Errors
    ///
    /// Same as [`Self::push`].
    pub fn finish(&mut self) -> Result<Vec<ChatEvent>, ProviderError> {
        let rest = std::mem::take(&mut self.buffer);
        let block = String::from_utf8_lossy(&rest).into_owned();
        if block.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.parse_block(&block)?.into_iter().collect())
    }

    fn next_block(&mut self) -> Option<String> {
        let (pos, sep_len) = [&b"\r\n\r\n"[..], &b"\n\n"[..]]
            .iter()
            .filter_map(|sep| find(&self.buffer, sep).map(|pos| (pos, sep.len())))
            .min_by_key(|(pos, _)| *pos)?;

        let block: Vec<u8> = self.buffer.drain(..pos + sep_len).take(pos).collect();
        Some(String::from_utf8_lossy(&block).into_owned())
    }

    fn parse_block(&mut self, block: &str) -> Result<Option<ChatEvent>, ProviderError> {
        let data = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect::<Vec<_>>()
            .join("\n");

        if data.is_empty() || self.done {
            return Ok(None);
        }
        if data.trim() == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: WireChunk = serde_json::from_str(&data)
            .map_err(|e| ProviderError::Decode(format!("failed to parse SSE event: {e}")))?;

        if let Some(error) = chunk.error {
            return Err(ProviderError::Upstream {
                status: 0,
                message: error.message,
            });
        }

        let content = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|c| !c.is_empty());
        let usage = chunk.usage.map(ChatUsage::from);

        if content.is_none() && usage.is_none() {
            return Ok(None);
        }
        Ok(Some(ChatEvent { content, usage }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    #[test]
    fn decodes_deltas_and_trailing_usage() {
        let mut decoder = SseDecoder::new();
        let body = format!(
            "{}{}data: {{\"choices\":[],\"usage\":{{\"prompt_tokens\":1500,\"completion_tokens\":800,\"total_tokens\":2300}}}}\n\ndata: [DONE]\n\n",
            delta("The stars"),
            delta(" align"),
        );

        let events = decoder.push(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].content.as_deref(), Some("The stars"));
        assert_eq!(events[1].content.as_deref(), Some(" align"));
        assert_eq!(events[2].usage.unwrap().total_units, 2300);
        assert!(decoder.is_done());
    }

    #[test]
    fn events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let body = delta("Venus");
        let (a, b) = body.as_bytes().split_at(17);

        assert!(decoder.push(a).unwrap().is_empty());
        let events = decoder.push(b).unwrap();
        assert_eq!(events[0].content.as_deref(), Some("Venus"));
    }

    #[test]
    fn multibyte_characters_survive_chunking() {
        let mut decoder = SseDecoder::new();
        let body = delta("♀ rising");
        let bytes = body.as_bytes();
        let split = body.find('♀').unwrap() + 1;

        let mut events = decoder.push(&bytes[..split]).unwrap();
        events.extend(decoder.push(&bytes[split..]).unwrap());
        assert_eq!(events[0].content.as_deref(), Some("♀ rising"));
    }

    #[test]
    fn crlf_terminators_and_comments() {
        let mut decoder = SseDecoder::new();
        let body = ": keep-alive\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n\r\n";
        let events = decoder.push(body.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content.as_deref(), Some("hi"));
    }

    #[test]
    fn role_only_chunks_are_skipped() {
        let mut decoder = SseDecoder::new();
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        assert!(decoder.push(body.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut decoder = SseDecoder::new();
        assert!(matches!(
            decoder.push(b"data: {not json\n\n"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn streamed_error_object_is_upstream_error() {
        let mut decoder = SseDecoder::new();
        let body = "data: {\"error\":{\"message\":\"overloaded\"}}\n\n";
        assert!(matches!(
            decoder.push(body.as_bytes()),
            Err(ProviderError::Upstream { .. })
        ));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        let body = "data: {\"usage\":{\"total_tokens\":42}}";
        assert!(decoder.push(body.as_bytes()).unwrap().is_empty());
        let events = decoder.finish().unwrap();
        assert_eq!(events[0].usage.unwrap().total_units, 42);
    }
}
