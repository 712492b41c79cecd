//! Newline-delimited JSON delta reader.
//!
//! Each chunk is decoded and split on its own. A record broken across two
//! chunks fails to parse on both halves and is dropped; upstream framing
//! is not guaranteed to be delimiter-safe, so this stays lossy on purpose.

use bytes::Bytes;
use futures::{ stream, Stream, StreamExt };
use log::debug;

use super::ChatError;
use crate::models::wire::StreamRecord;

/// Extracts every non-empty `delta` from one chunk, in order.
pub fn parse_chunk(chunk: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(chunk);
    let mut deltas = Vec::new();

    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamRecord>(line) {
            Ok(StreamRecord { delta: Some(delta) }) if !delta.is_empty() => deltas.push(delta),
            Ok(_) => {}
            Err(e) => {
                debug!("Skipping unparseable stream line ({}): {:?}", e, line);
            }
        }
    }

    deltas
}

/// Lazily turns a response body into its sequence of deltas. A transport
/// error mid-body is yielded once and ends the sequence.
pub fn deltas<S>(body: S) -> impl Stream<Item = Result<String, ChatError>> + Send
    where S: Stream<Item = Result<Bytes, ChatError>> + Send
{
    body.scan(false, |failed, chunk| {
        if *failed {
            return futures::future::ready(None);
        }
        let items: Vec<Result<String, ChatError>> = match chunk {
            Ok(bytes) => parse_chunk(&bytes).into_iter().map(Ok).collect(),
            Err(e) => {
                *failed = true;
                vec![Err(e)]
            }
        };
        futures::future::ready(Some(stream::iter(items)))
    }).flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ChatError>> + Send {
        let owned: Vec<Result<Bytes, ChatError>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect(parts: &[&str]) -> String {
        deltas(chunks(parts))
            .map(|d| d.unwrap())
            .collect::<Vec<_>>().await
            .concat()
    }

    #[test]
    fn parses_lines_in_order() {
        let got = parse_chunk(b"{\"delta\":\"Hel\"}\n{\"delta\":\"lo\"}\n");
        assert_eq!(got, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[test]
    fn skips_garbage_and_records_without_delta() {
        let got = parse_chunk(
            b"not json\n\n{\"type\":\"ping\"}\n{\"delta\":null}\n{\"delta\":\"\"}\n{\"delta\":\"ok\",\"id\":3}\n"
        );
        assert_eq!(got, vec!["ok".to_string()]);
    }

    #[test]
    fn accepts_final_line_without_newline() {
        assert_eq!(parse_chunk(b"{\"delta\":\"tail\"}"), vec!["tail".to_string()]);
    }

    #[tokio::test]
    async fn chunking_on_line_boundaries_does_not_change_result() {
        let whole = collect(&["{\"delta\":\"a\"}\n{\"delta\":\"b\"}\n{\"delta\":\"c\"}\n"]).await;
        let split = collect(&["{\"delta\":\"a\"}\n", "{\"delta\":\"b\"}\n{\"delta\":\"c\"}\n"]).await;
        let one_each = collect(&["{\"delta\":\"a\"}", "\n{\"delta\":\"b\"}", "\n{\"delta\":\"c\"}\n"]).await;
        assert_eq!(whole, "abc");
        assert_eq!(split, "abc");
        assert_eq!(one_each, "abc");
    }

    #[tokio::test]
    async fn record_split_mid_line_is_lost() {
        let got = collect(&["{\"delta\":\"a\"}\n{\"del", "ta\":\"b\"}\n{\"delta\":\"c\"}\n"]).await;
        assert_eq!(got, "ac");
    }

    #[tokio::test]
    async fn transport_error_ends_the_sequence() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"delta\":\"a\"}\n")),
            Err(ChatError::MissingStream),
            Ok(Bytes::from_static(b"{\"delta\":\"b\"}\n")),
        ]);
        let items: Vec<_> = deltas(body).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Ok(ref d) if d == "a"));
        assert!(matches!(items[1], Err(ChatError::MissingStream)));
    }
}
