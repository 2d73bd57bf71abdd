use async_trait::async_trait;

use crate::types::{ShieldResult, SignedPayload, TxRequest};

/// 외부 서명자 경계
///
/// 원시 키 자료는 이 경계 밖(Router 포함)으로 절대 나오지 않는다.
/// 키 부재와 정책 거부는 ShieldError::SignerUnavailable /
/// ShieldError::SignerPolicy로 구분해 보고한다
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, request: &TxRequest) -> ShieldResult<SignedPayload>;
}
