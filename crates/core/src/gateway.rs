use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature::SignatureStrategy;

/// Default replay window applied to timestamped signatures.
pub const DEFAULT_REPLAY_TOLERANCE: Duration = Duration::from_secs(300);

/// Payment gateways whose webhooks can be ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    Stripe,
    Cryptomus,
    NowPayments,
    CoinGate,
}

impl Gateway {
    pub const ALL: [Gateway; 4] = [
        Gateway::Stripe,
        Gateway::Cryptomus,
        Gateway::NowPayments,
        Gateway::CoinGate,
    ];

    /// Lowercase slug used in dedup keys, routes, metric labels and env prefixes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Cryptomus => "cryptomus",
            Self::NowPayments => "nowpayments",
            Self::CoinGate => "coingate",
        }
    }

    /// Header carrying the webhook signature.
    pub fn signature_header(self) -> &'static str {
        match self {
            Self::Stripe => "Stripe-Signature",
            Self::Cryptomus => "sign",
            Self::NowPayments => "x-nowpayments-sig",
            Self::CoinGate => "X-CoinGate-Signature",
        }
    }

    /// Verification algorithm the gateway signs its callbacks with.
    pub fn default_strategy(self) -> SignatureStrategy {
        match self {
            Self::Stripe => SignatureStrategy::TimestampedHmac {
                tolerance: DEFAULT_REPLAY_TOLERANCE,
            },
            Self::Cryptomus => SignatureStrategy::DigestOfEncodedPayload,
            Self::NowPayments | Self::CoinGate => SignatureStrategy::RawHmac,
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown gateway: {0}")]
pub struct UnknownGateway(pub String);

impl FromStr for Gateway {
    type Err = UnknownGateway;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "cryptomus" => Ok(Self::Cryptomus),
            "nowpayments" | "nowpayment" | "now_payments" => Ok(Self::NowPayments),
            "coingate" => Ok(Self::CoinGate),
            _ => Err(UnknownGateway(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_round_trip_through_from_str() {
        for gateway in Gateway::ALL {
            assert_eq!(gateway.as_str().parse::<Gateway>(), Ok(gateway));
        }
    }

    #[test]
    fn accepts_aliases_and_mixed_case() {
        assert_eq!("NowPayment".parse::<Gateway>(), Ok(Gateway::NowPayments));
        assert_eq!("now_payments".parse::<Gateway>(), Ok(Gateway::NowPayments));
        assert_eq!("CoinGate".parse::<Gateway>(), Ok(Gateway::CoinGate));
    }

    #[test]
    fn rejects_unknown_gateway() {
        let err = "paypal".parse::<Gateway>().unwrap_err();
        assert_eq!(err, UnknownGateway("paypal".to_string()));
    }

    #[test]
    fn stripe_uses_timestamped_strategy() {
        assert!(matches!(
            Gateway::Stripe.default_strategy(),
            SignatureStrategy::TimestampedHmac { tolerance } if tolerance.as_secs() == 300
        ));
        assert_eq!(
            Gateway::Cryptomus.default_strategy(),
            SignatureStrategy::DigestOfEncodedPayload
        );
    }
}
