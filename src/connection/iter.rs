//! Lazy iteration over a multi-bulk reply still on the wire.

use super::stream::StreamConnection;
use super::Connection;
use crate::error::{Error, Result};
use crate::protocol::Reply;
use tracing::debug;

/// Single-pass iterator over the elements of an array reply.
///
/// Each element is read from the socket on demand (nested arrays are
/// materialized). The stream stays desynchronized until every element is
/// consumed, so dropping the iterator early disconnects the connection.
/// Call [`MultiBulkIter::drain`] to discard the rest and keep the
/// connection usable.
pub struct MultiBulkIter<'a> {
    connection: &'a mut StreamConnection,
    remaining: usize,
    len: usize,
}

impl<'a> MultiBulkIter<'a> {
    pub(crate) fn new(connection: &'a mut StreamConnection, len: usize) -> Self {
        Self {
            connection,
            remaining: len,
            len,
        }
    }

    /// Total element count announced by the server.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements not yet read.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Read and discard every remaining element.
    pub fn drain(mut self) -> Result<()> {
        while self.remaining > 0 {
            self.remaining -= 1;
            if let Err(e) = self.connection.read_reply() {
                self.remaining = 0;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abandon the iterator and close the connection.
    pub fn close(mut self) {
        self.remaining = 0;
        self.connection.disconnect();
    }

    /// Iterate the elements two at a time.
    ///
    /// Fails (and disconnects) if the element count is odd.
    pub fn tuples(self) -> Result<MultiBulkTuples<'a>> {
        if self.len % 2 != 0 {
            let len = self.len;
            let endpoint = self.connection.endpoint();
            self.close();
            return Err(Error::connection(
                endpoint,
                format!("cannot iterate {len} elements as pairs"),
            ));
        }
        Ok(MultiBulkTuples { inner: self })
    }
}

impl Iterator for MultiBulkIter<'_> {
    type Item = Result<Reply>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.connection.read_reply() {
            Ok(reply) => Some(Ok(reply)),
            Err(e) => {
                // the connection already closed itself
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl Drop for MultiBulkIter<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            debug!(
                endpoint = %self.connection.endpoint(),
                remaining = self.remaining,
                "multi-bulk reply abandoned; disconnecting"
            );
            self.connection.disconnect();
        }
    }
}

impl std::fmt::Debug for MultiBulkIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBulkIter")
            .field("len", &self.len)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Pairs from a [`MultiBulkIter`] with an even element count.
#[derive(Debug)]
pub struct MultiBulkTuples<'a> {
    inner: MultiBulkIter<'a>,
}

impl MultiBulkTuples<'_> {
    /// Pairs not yet read.
    pub fn remaining(&self) -> usize {
        self.inner.remaining() / 2
    }

    /// Read and discard every remaining pair.
    pub fn drain(self) -> Result<()> {
        self.inner.drain()
    }
}

impl Iterator for MultiBulkTuples<'_> {
    type Item = Result<(Reply, Reply)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.inner.next()? {
            Ok(reply) => reply,
            Err(e) => return Some(Err(e)),
        };
        match self.inner.next() {
            Some(Ok(second)) => Some(Ok((first, second))),
            Some(Err(e)) => Some(Err(e)),
            None => None,
        }
    }
}
