/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::error;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::host::dma::ScatterList;
use crate::host::keyslot::KeySlot;
use crate::se::encoder::CmacSubkeys;
use crate::se::protocol::{CipherMode, Direction, IvPolicy, KeyRef, OpMode, ShaAlgorithm};

/// What a request asks the engine to do.
#[derive(Debug, Clone)]
pub enum Operation {
    Cipher {
        mode: CipherMode,
        direction: Direction,
        key: KeyRef,
        iv: IvPolicy,
    },
    Cmac {
        key: KeyRef,
        subkeys: CmacSubkeys,
    },
    Digest {
        alg: ShaAlgorithm,
    },
    Rsa {
        slot: u8,
        mod_len: usize,
        exp_len: usize,
    },
}

impl Operation {
    pub fn mode(&self) -> OpMode {
        match self {
            Operation::Cipher { mode, .. } => (*mode).into(),
            Operation::Cmac { .. } => OpMode::Cmac,
            Operation::Digest { alg } => OpMode::Sha(*alg),
            Operation::Rsa { .. } => OpMode::Rsa,
        }
    }

    /// Bytes the engine writes back, when it is not the transformed input itself.
    pub fn result_len(&self) -> Option<usize> {
        match self {
            Operation::Cipher { .. } => None,
            Operation::Cmac { .. } => Some(crate::se::protocol::CMAC_RESULT_SIZE),
            Operation::Digest { alg } => Some(alg.digest_len()),
            Operation::Rsa { mod_len, .. } => Some(*mod_len),
        }
    }
}

/// Result of a completed request.
#[derive(Debug, Clone)]
pub enum Output {
    /// The destination list, filled.
    Data(ScatterList),
    /// Digest, MAC tag or RSA result.
    Digest(Vec<u8>),
}

impl Output {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Output::Data(list) => list.gather(),
            Output::Digest(bytes) => bytes,
        }
    }
}

/// A queued request. It resolves its completion exactly once: explicitly, or
/// with an error when dropped unresolved.
///
/// A request holding a key slot keeps it allocated until it resolves, so the
/// slot cannot be handed to another context while the request is queued or in
/// flight.
pub struct PendingRequest {
    pub op: Operation,
    pub src: ScatterList,
    pub dst: Option<ScatterList>,
    key_slot: Option<Arc<KeySlot>>,
    completion: Option<oneshot::Sender<Result<Output>>>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("op", &self.op.mode())
            .field("len", &self.src.len())
            .field("resolved", &self.completion.is_none())
            .finish()
    }
}

impl PendingRequest {
    pub fn new(op: Operation, src: ScatterList, dst: Option<ScatterList>) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            op,
            src,
            dst,
            key_slot: None,
            completion: Some(tx),
        };
        (request, Completion { rx })
    }

    /// Keeps `slot` allocated for the lifetime of this request.
    pub fn pin_key_slot(mut self, slot: Option<Arc<KeySlot>>) -> Self {
        self.key_slot = slot;
        self
    }

    pub fn key_slot(&self) -> Option<u8> {
        self.key_slot.as_ref().map(|slot| slot.id())
    }

    pub fn byte_len(&self) -> usize {
        self.src.len()
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_none()
    }

    /// Delivers `result`. Later calls do nothing.
    pub fn resolve(&mut self, result: Result<Output>) {
        // The pin goes first: a caller woken by the result may rekey right away.
        self.key_slot = None;
        if let Some(tx) = self.completion.take() {
            // The caller may have stopped listening.
            let _ = tx.send(result);
        }
    }

    pub fn fail(&mut self, err: Error) {
        self.resolve(Err(err));
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.completion.is_some() {
            error!("{} request dropped unresolved", self.op.mode());
            self.fail(Error::Internal("request dropped before completion".into()));
        }
    }
}

/// Future side of a [`PendingRequest`].
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<Output>>,
}

impl Completion {
    /// A completion that is already resolved with `result`.
    pub fn ready(result: Result<Output>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for Completion {
    type Output = Result<Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(Error::Internal("completion channel closed".into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_request() -> (PendingRequest, Completion) {
        PendingRequest::new(
            Operation::Digest {
                alg: ShaAlgorithm::Sha256,
            },
            vec![1u8, 2, 3].into(),
            None,
        )
    }

    #[tokio::test]
    async fn resolves_once() {
        let (mut req, completion) = digest_request();
        req.resolve(Ok(Output::Digest(vec![1])));
        req.fail(Error::InProgress);
        assert!(req.is_resolved());
        assert_eq!(completion.await.unwrap().into_bytes(), vec![1]);
    }

    #[tokio::test]
    async fn dropping_unresolved_fails_the_caller() {
        let (req, completion) = digest_request();
        drop(req);
        assert!(matches!(completion.await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn key_slot_is_held_until_resolved() {
        use crate::host::keyslot::{KeySlotAllocator, KeyTable, SlotState};

        let table = Arc::new(KeySlotAllocator::new(KeyTable::Symmetric, 4, &[0]));
        let slot = Arc::new(table.allocate().unwrap());
        let (req, completion) = digest_request();
        let mut req = req.pin_key_slot(Some(Arc::clone(&slot)));
        drop(slot);
        assert_eq!(req.key_slot(), Some(1));
        assert_eq!(table.state(1), Some(SlotState::InUse));

        req.resolve(Ok(Output::Digest(vec![])));
        assert_eq!(table.state(1), Some(SlotState::Free));
        assert!(completion.await.is_ok());
    }

    #[tokio::test]
    async fn ready_completion() {
        let done = Completion::ready(Err(Error::config("nope")));
        assert_eq!(done.await.unwrap_err(), Error::config("nope"));
    }

    #[test]
    fn result_lengths() {
        let (req, _c) = digest_request();
        assert_eq!(req.op.result_len(), Some(32));
        assert_eq!(req.byte_len(), 3);
        let rsa = Operation::Rsa {
            slot: 0,
            mod_len: 128,
            exp_len: 4,
        };
        assert_eq!(rsa.result_len(), Some(128));
        assert_eq!(rsa.mode(), OpMode::Rsa);
    }
}
