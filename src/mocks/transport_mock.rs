use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;

use crate::submission::channels::ChannelTransport;
use crate::submission::signer::TransactionSigner;
use crate::types::{
    ShieldError, ShieldResult, SignedPayload, SubmissionChannel, SubmissionReceipt, TxRequest,
};

/// 호출을 기록하는 채널 전송 계층
pub struct MockTransport {
    channel: SubmissionChannel,
    calls: AtomicUsize,
    payloads: Mutex<Vec<SignedPayload>>,
    reject_with: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new(channel: SubmissionChannel) -> Self {
        Self {
            channel,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
            reject_with: Mutex::new(None),
        }
    }

    /// 이후의 제출을 릴레이 거절로 실패시킨다
    pub fn fail_with_rejection(&self, reason: &str) {
        *self.reject_with.lock().expect("lock") = Some(reason.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<SignedPayload> {
        self.payloads.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    fn channel(&self) -> SubmissionChannel {
        self.channel
    }

    async fn submit(
        &self,
        payload: &SignedPayload,
        _target_block: Option<u64>,
    ) -> ShieldResult<SubmissionReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().expect("lock").push(payload.clone());

        if let Some(reason) = self.reject_with.lock().expect("lock").clone() {
            return Err(ShieldError::RelayRejected(reason));
        }

        Ok(SubmissionReceipt {
            channel: self.channel,
            handle: format!("{:?}", payload.hash),
            submitted_at: Utc::now(),
        })
    }
}

/// 결정적 가짜 서명자
///
/// 요청 필드를 이어붙인 바이트를 "서명 결과"로 쓰므로
/// 같은 요청은 항상 같은 해시가 나온다
pub struct MockSigner;

impl MockSigner {
    pub fn new() -> Self {
        Self
    }

    fn encode(request: &TxRequest) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&request.chain_id.to_be_bytes());
        raw.extend_from_slice(&request.nonce.to_be_bytes());
        raw.extend_from_slice(request.to.as_bytes());

        let mut word = [0u8; 32];
        request.value.to_big_endian(&mut word);
        raw.extend_from_slice(&word);
        request.gas_limit.to_big_endian(&mut word);
        raw.extend_from_slice(&word);
        request.max_fee.to_big_endian(&mut word);
        raw.extend_from_slice(&word);
        request.priority_fee.to_big_endian(&mut word);
        raw.extend_from_slice(&word);

        raw.extend_from_slice(request.input.as_ref());
        raw.push(request.decoy as u8);
        raw
    }

    /// 서명 없이 결과 페이로드를 미리 계산한다 (테스트용)
    pub fn preview(&self, request: &TxRequest) -> SignedPayload {
        let raw = Self::encode(request);
        let hash = H256::from(keccak256(&raw));
        SignedPayload {
            raw: Bytes::from(raw),
            hash,
            chain_id: request.chain_id,
            pair: request.pair.clone(),
            decoy: request.decoy,
        }
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign(&self, request: &TxRequest) -> ShieldResult<SignedPayload> {
        Ok(self.preview(request))
    }
}

/// 키가 없는 서명자
pub struct UnavailableSigner;

#[async_trait]
impl TransactionSigner for UnavailableSigner {
    async fn sign(&self, _request: &TxRequest) -> ShieldResult<SignedPayload> {
        Err(ShieldError::SignerUnavailable("key store locked".to_string()))
    }
}

/// 정책상 서명을 거부하는 서명자
pub struct RejectingSigner {
    reason: String,
}

impl RejectingSigner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl TransactionSigner for RejectingSigner {
    async fn sign(&self, _request: &TxRequest) -> ShieldResult<SignedPayload> {
        Err(ShieldError::SignerPolicy(self.reason.clone()))
    }
}
