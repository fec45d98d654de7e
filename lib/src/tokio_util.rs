//! Helpers bridging the synchronous repository core to Tokio.
//!
//! The core carries no implicit concurrency contract; these wrappers run
//! one synchronous call on a worker thread and surface cancellation as a
//! [`Cancellable`] triggered when the future is dropped.

use std::sync::Arc;

use futures_util::{Future, FutureExt};

use crate::{Cancellable, Checksum, Error, ObjectType, Repo, Result};

struct CancelOnDrop(Cancellable);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Wrapper for [`tokio::task::spawn_blocking`] which provides a
/// [`Cancellable`] that will be triggered when the returned handle is
/// dropped, which helps bound thread usage.
pub fn spawn_blocking_cancellable<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce(&Cancellable) -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let dropper = CancelOnDrop(Cancellable::new());
        f(&dropper.0)
    })
}

fn flatten_join<T>(r: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match r {
        Ok(x) => x,
        Err(e) => Err(Error::Io {
            context: "Joining worker".into(),
            source: std::io::Error::other(e),
        }),
    }
}

/// A wrapper around [`spawn_blocking_cancellable`] that flattens nested
/// results.
pub fn spawn_blocking_cancellable_flatten<F, T>(f: F) -> impl Future<Output = Result<T>>
where
    F: FnOnce(&Cancellable) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking_cancellable(f).map(flatten_join)
}

impl Repo {
    /// Asynchronously store a metadata object; the synchronous
    /// [`Repo::write_metadata`] runs on a worker thread.
    pub async fn write_metadata_async(
        self: &Arc<Self>,
        objtype: ObjectType,
        expected: Option<Checksum>,
        object: Vec<u8>,
    ) -> Result<Checksum> {
        let repo = Arc::clone(self);
        spawn_blocking_cancellable_flatten(move |cancellable| {
            repo.write_metadata(objtype, expected.as_ref(), &object, Some(cancellable))
        })
        .await
    }

    /// Asynchronously store a content object from its canonical stream
    /// bytes; the synchronous [`Repo::write_content`] runs on a worker
    /// thread.
    pub async fn write_content_async(
        self: &Arc<Self>,
        expected: Option<Checksum>,
        content: Vec<u8>,
        length: u64,
    ) -> Result<Checksum> {
        let repo = Arc::clone(self);
        spawn_blocking_cancellable_flatten(move |cancellable| {
            repo.write_content(
                expected.as_ref(),
                std::io::Cursor::new(content),
                length,
                Some(cancellable),
            )
        })
        .await
    }
}
