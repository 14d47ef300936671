use std::{
    io::Error,
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::AsyncWrite;

use crate::{AccumulatorError, DigestAccumulator};

pin_project! {
    /// Wraps an [`AsyncWrite`] and feeds every byte the inner writer accepts
    /// into a [`DigestAccumulator`].
    ///
    /// Nothing is buffered: when the inner writer is not ready the write is
    /// pending, which in turn suspends whoever is producing the data. Call
    /// [`AccumulatingWriter::into_parts`] to get the writer and the
    /// accumulator back.
    #[derive(Debug)]
    pub struct AccumulatingWriter<W> {
        #[pin]
        writer: W,
        accumulator: DigestAccumulator,
    }
}

impl<W> AccumulatingWriter<W> {
    /// Constructs a new instance that forwards to `writer`.
    pub fn new(writer: W, accumulator: DigestAccumulator) -> Self {
        Self {
            writer,
            accumulator,
        }
    }

    /// Returns the accumulator.
    pub fn accumulator(&self) -> &DigestAccumulator {
        &self.accumulator
    }

    /// Returns a reference to the wrapped writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Consumes this instance and returns the wrapped writer and the
    /// accumulator.
    pub fn into_parts(self) -> (W, DigestAccumulator) {
        (self.writer, self.accumulator)
    }
}

impl<W: AsyncWrite> AsyncWrite for AccumulatingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        let this = self.project();

        // Refuse before writing, bytes that reach the writer must be hashed.
        if this.accumulator.is_finalized() {
            return Poll::Ready(Err(Error::other(AccumulatorError::Finalized)));
        }

        let bytes = ready!(this.writer.poll_write(cx, buf))?;
        this.accumulator
            .consume(&buf[..bytes])
            .map_err(Error::other)?;
        Poll::Ready(Ok(bytes))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.project().writer.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use std::pin::pin;

    use futures::task::noop_waker_ref;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{DigestEncoding, HashAlgorithm};

    fn accumulator() -> DigestAccumulator {
        DigestAccumulator::new(HashAlgorithm::Sha224, DigestEncoding::Hex)
    }

    #[test]
    fn test_only_accepted_bytes_are_consumed() {
        let (writer, _reader) = tokio::io::duplex(16);
        let mut writer = pin!(AccumulatingWriter::new(writer, accumulator()));
        let mut cx = Context::from_waker(noop_waker_ref());

        let data = [1u8; 64];
        let accepted = match writer.as_mut().poll_write(&mut cx, &data) {
            Poll::Ready(Ok(bytes)) => bytes,
            other => panic!("expected a partial write, got {other:?}"),
        };
        assert_eq!(accepted, 16);
        assert_eq!(writer.accumulator().current_state().size_bytes, 16);

        // The pipe is full, the write must suspend without consuming anything.
        assert!(writer.as_mut().poll_write(&mut cx, &data[16..]).is_pending());
        assert_eq!(writer.accumulator().current_state().size_bytes, 16);
    }

    #[tokio::test]
    async fn test_forwards_unmodified() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let mut writer = AccumulatingWriter::new(writer, accumulator());
        writer.write_all(b"bar").await.unwrap();
        writer.shutdown().await.unwrap();

        let (inner, mut accumulator) = writer.into_parts();
        drop(inner);

        let mut forwarded = Vec::new();
        reader.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"bar");

        let state = accumulator.finalize().unwrap();
        assert_eq!(state.size_bytes, 3);
        assert_eq!(
            state.content_address.as_deref(),
            Some("07daf010de7f7f0d8d76a76eb8d1eb40182c8d1e7a3877a6686c9bf0")
        );
    }

    #[tokio::test]
    async fn test_refuses_after_finalize() {
        let mut accumulator = accumulator();
        accumulator.finalize().unwrap();

        let mut writer = AccumulatingWriter::new(Vec::new(), accumulator);
        let err = writer.write_all(b"bar").await.unwrap_err();
        assert_eq!(
            AccumulatorError::from_io(&err),
            Some(&AccumulatorError::Finalized)
        );
        assert!(writer.get_ref().is_empty());
    }
}
