// Lazy frame sequence over a streamed response body.
use anyhow::Result;
use futures::{Stream, StreamExt, stream};
use stratus_transport::ByteStream;
use stratus_wire::{StreamDecoder, StreamFrame};

struct FrameReader {
    body: ByteStream,
    decoder: StreamDecoder,
    finished: bool,
}

/// Frames decoded from `body`, ending when the body ends. A decode or read
/// error is yielded once and terminates the sequence; a trailing partial
/// frame is discarded.
pub(crate) fn frames(
    body: ByteStream,
    max_line_bytes: usize,
) -> impl Stream<Item = Result<StreamFrame>> + Send {
    let reader = FrameReader {
        body,
        decoder: StreamDecoder::new(max_line_bytes),
        finished: false,
    };
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        loop {
            match reader.decoder.next_frame() {
                Ok(Some(frame)) => return Some((Ok(frame), Some(reader))),
                Ok(None) if reader.finished => return None,
                Ok(None) => {}
                Err(err) => {
                    let err = anyhow::Error::new(err).context("decode stream frame");
                    return Some((Err(err), None));
                }
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.decoder.push(&chunk),
                Some(Err(err)) => return Some((Err(err), None)),
                None => reader.finished = true,
            }
        }
    })
}
