//! Frames on a worker's result pipe.
//!
//! Each worker writes exactly one frame: a 4-byte big-endian length followed
//! by the JSON of its report. The watcher reads it back through a `FramedRead`
//! on the pipe's read end. The worker side encodes into a buffer and writes it
//! with a blocking write, since a forked child never runs the async runtime.

use std::io;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub(crate) struct JsonCodec<T> {
  inner: LengthDelimitedCodec,
  _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Largest report payload a worker may send. Both ends use the same codec, so
/// the writer refuses what the reader would reject.
pub(crate) const MAX_REPORT_FRAME: usize = 8 * 1024 * 1024;

impl<T> JsonCodec<T> {
  pub(crate) fn new() -> Self {
    Self {
      inner: LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_REPORT_FRAME)
        .new_codec(),
      _phantom: PhantomData,
    }
  }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
  type Item = T;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    match self.inner.decode(src)? {
      Some(bytes) => {
        let item = serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
      }
      None => Ok(None),
    }
  }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
  type Error = io::Error;

  // Called in forked workers: must not log.
  fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let json = serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    self.inner.encode(Bytes::from(json), dst)
  }
}
