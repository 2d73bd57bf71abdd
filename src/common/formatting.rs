use ethers::types::U256;

use crate::constants::{WEI_PER_ETH, WEI_PER_GWEI};

/// Format wei amount to ETH with specified decimals
pub fn format_eth(wei: U256, decimals: usize) -> String {
    let eth = wei.as_u128() as f64 / WEI_PER_ETH as f64;
    format!("{:.1$}", eth, decimals)
}

/// Format gas price from wei to gwei
pub fn format_gwei(wei: U256) -> String {
    let gwei = wei.as_u128() as f64 / WEI_PER_GWEI as f64;
    format!("{:.2} gwei", gwei)
}

/// Format percentage
pub fn format_percentage(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

/// gwei(f64)를 wei(U256)로 변환
pub fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei * WEI_PER_GWEI as f64) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gwei() {
        assert_eq!(format_gwei(U256::from(50_000_000_000u64)), "50.00 gwei");
    }

    #[test]
    fn test_gwei_to_wei_roundtrip() {
        assert_eq!(gwei_to_wei(2.0), U256::from(2_000_000_000u64));
        assert_eq!(gwei_to_wei(0.5), U256::from(500_000_000u64));
    }
}
