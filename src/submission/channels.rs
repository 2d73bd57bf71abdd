use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::utils::keccak256;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::blockchain::ConnectionManager;
use crate::common::RetryPolicy;
use crate::types::{ShieldError, ShieldResult, SignedPayload, SubmissionChannel, SubmissionReceipt};

/// 제출 채널 전송 계층
///
/// 채널마다 구현이 하나씩 주입되므로 개별 교체/테스트가 가능하다
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn channel(&self) -> SubmissionChannel;

    async fn submit(
        &self,
        payload: &SignedPayload,
        target_block: Option<u64>,
    ) -> ShieldResult<SubmissionReceipt>;
}

/// 일시적 네트워크 오류만 정책 한도 안에서 재시도한다.
/// 릴레이의 명시적 거절은 재시도 대상이 아니다
async fn with_retry<F, Fut>(policy: &RetryPolicy, channel: SubmissionChannel, mut operation: F) -> ShieldResult<SubmissionReceipt>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ShieldResult<SubmissionReceipt>>,
{
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(receipt) => return Ok(receipt),
            Err(e @ (ShieldError::Network(_) | ShieldError::SubmissionTimeout { .. }))
                if !policy.is_exhausted(attempt + 1) =>
            {
                warn!("⚠️ {} 채널 제출 재시도 {}: {}", channel, attempt + 1, e);
                tokio::time::sleep(policy.delay_for(attempt as u32)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn map_send_error(channel: SubmissionChannel, e: reqwest::Error) -> ShieldError {
    if e.is_timeout() {
        ShieldError::SubmissionTimeout { channel }
    } else {
        ShieldError::Network(e.to_string())
    }
}

fn raw_hex(payload: &SignedPayload) -> String {
    format!("0x{}", hex::encode(payload.raw.as_ref()))
}

/// 공개 멤풀 제출 (엔드포인트 풀 페일오버 사용)
pub struct PublicRpcTransport {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
}

impl PublicRpcTransport {
    pub fn new(manager: Arc<ConnectionManager>, policy: RetryPolicy) -> Self {
        Self { manager, policy }
    }
}

#[async_trait]
impl ChannelTransport for PublicRpcTransport {
    fn channel(&self) -> SubmissionChannel {
        SubmissionChannel::Normal
    }

    async fn submit(
        &self,
        payload: &SignedPayload,
        _target_block: Option<u64>,
    ) -> ShieldResult<SubmissionReceipt> {
        let raw = raw_hex(payload);
        with_retry(&self.policy, SubmissionChannel::Normal, || {
            let raw = raw.clone();
            async move {
                let result = self
                    .manager
                    .rpc_call("eth_sendRawTransaction", json!([raw]))
                    .await?;
                let handle = result.as_str().unwrap_or_default().to_string();
                debug!("📤 공개 제출 완료: {}", handle);
                Ok(SubmissionReceipt {
                    channel: SubmissionChannel::Normal,
                    handle,
                    submitted_at: Utc::now(),
                })
            }
        })
        .await
    }
}

/// 프라이빗 릴레이 직송 (공개 멤풀을 거치지 않는다)
pub struct PrivateRelayTransport {
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
    timeout: Duration,
}

impl PrivateRelayTransport {
    pub fn new(url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            policy,
            timeout: Duration::from_secs(10),
        }
    }

    async fn send_once(&self, payload: &SignedPayload, target_block: Option<u64>) -> ShieldResult<SubmissionReceipt> {
        let mut params = json!({ "tx": raw_hex(payload) });
        if let Some(block) = target_block {
            params["maxBlockNumber"] = json!(format!("0x{:x}", block));
        }
        let body = json!({
            "jsonrpc": "2.0", "id": 1,
            "method": "eth_sendPrivateTransaction",
            "params": [params],
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(SubmissionChannel::Private, e))?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| ShieldError::Network(e.to_string()))?;

        if let Some(err) = value.get("error") {
            return Err(ShieldError::RelayRejected(err.to_string()));
        }

        let handle = value
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(SubmissionReceipt {
            channel: SubmissionChannel::Private,
            handle,
            submitted_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ChannelTransport for PrivateRelayTransport {
    fn channel(&self) -> SubmissionChannel {
        SubmissionChannel::Private
    }

    async fn submit(
        &self,
        payload: &SignedPayload,
        target_block: Option<u64>,
    ) -> ShieldResult<SubmissionReceipt> {
        with_retry(&self.policy, SubmissionChannel::Private, || {
            self.send_once(payload, target_block)
        })
        .await
    }
}

/// 번들 릴레이 제출
///
/// 트랜잭션 하나를 단일 트랜잭션 번들로 묶어 다음 블록을 노린다.
/// 요청이 없는 한 min/max timestamp 제약은 걸지 않는다
pub struct BundleRelayTransport {
    url: String,
    client: reqwest::Client,
    /// 릴레이 평판용 신원 키. 자금 키와 무관하다
    identity: LocalWallet,
    policy: RetryPolicy,
    timeout: Duration,
}

impl BundleRelayTransport {
    pub fn new(url: impl Into<String>, identity: LocalWallet, policy: RetryPolicy) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            identity,
            policy,
            timeout: Duration::from_secs(10),
        }
    }

    /// 환경 변수의 신원 키를 쓰고, 없으면 새로 만든다
    pub fn identity_from_env() -> LocalWallet {
        match std::env::var("RELAY_IDENTITY_KEY") {
            Ok(key) => key.parse().unwrap_or_else(|_| {
                warn!("⚠️ RELAY_IDENTITY_KEY 파싱 실패, 임시 신원 키 생성");
                LocalWallet::new(&mut rand::thread_rng())
            }),
            Err(_) => {
                info!("🔑 릴레이 신원 키 미설정, 임시 키 생성");
                LocalWallet::new(&mut rand::thread_rng())
            }
        }
    }

    async fn send_once(&self, payload: &SignedPayload, target_block: u64) -> ShieldResult<SubmissionReceipt> {
        let body = json!({
            "jsonrpc": "2.0", "id": 1,
            "method": "eth_sendBundle",
            "params": [{
                "txs": [raw_hex(payload)],
                "blockNumber": format!("0x{:x}", target_block),
            }],
        });
        let body_text = body.to_string();

        // 릴레이 인증 헤더: 본문 해시에 대한 신원 키 서명
        let digest = format!("0x{}", hex::encode(keccak256(body_text.as_bytes())));
        let signature = self
            .identity
            .sign_message(digest)
            .await
            .map_err(|e| ShieldError::Network(format!("신원 서명 실패: {}", e)))?;
        let header = format!("{:?}:0x{}", self.identity.address(), signature);

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("X-Flashbots-Signature", header)
            .header("Content-Type", "application/json")
            .body(body_text)
            .send()
            .await
            .map_err(|e| map_send_error(SubmissionChannel::Bundle, e))?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| ShieldError::Network(e.to_string()))?;

        if let Some(err) = value.get("error") {
            return Err(ShieldError::RelayRejected(err.to_string()));
        }

        let handle = value
            .get("result")
            .and_then(|r| r.get("bundleHash"))
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();

        info!("📦 번들 제출 완료: target_block={} handle={}", target_block, handle);

        Ok(SubmissionReceipt {
            channel: SubmissionChannel::Bundle,
            handle,
            submitted_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ChannelTransport for BundleRelayTransport {
    fn channel(&self) -> SubmissionChannel {
        SubmissionChannel::Bundle
    }

    async fn submit(
        &self,
        payload: &SignedPayload,
        target_block: Option<u64>,
    ) -> ShieldResult<SubmissionReceipt> {
        let target = target_block.ok_or_else(|| {
            ShieldError::Config("번들 채널에는 목표 블록이 필요합니다".to_string())
        })?;
        with_retry(&self.policy, SubmissionChannel::Bundle, || {
            self.send_once(payload, target)
        })
        .await
    }
}
