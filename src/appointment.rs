//! Appointment data model
//!
//! An appointment is the hiring contract between a customer and the tower:
//! one event filter, one response payload, one block window. Records are
//! immutable once accepted; a higher `job_id` for the same locator replaces
//! the live appointment.

use std::fmt;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Payment hash accepted by the free tier.
///
/// The tower rejects any request whose `payment_hash` differs from
/// `keccak256("on-the-house")`.
pub fn free_tier_payment_hash() -> B256 {
    keccak256(b"on-the-house")
}

/// A signed hiring contract covering one event in one block window.
///
/// Wire format: byte fields are 0x-prefixed hex, `refund` is a decimal
/// string (it can exceed 2^53), block numbers and ids are plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    /// External contract the appointment watches
    pub contract_address: Address,

    /// Customer hiring the tower
    pub customer_address: Address,

    /// First block of the watch window
    pub start_block: u64,

    /// Last block of the watch window
    pub end_block: u64,

    /// Blocks available to respond after a trigger
    pub challenge_period: u64,

    /// Customer-facing identifier; not unique across customers
    pub customer_chosen_id: u64,

    /// Monotone per locator; highest job wins
    pub job_id: u64,

    /// Exact call payload submitted on response
    pub data: Bytes,

    /// Refund owed to the customer on tower failure, in wei
    #[serde(with = "decimal_u256")]
    pub refund: U256,

    /// Gas limit for the response transaction
    pub gas_limit: u64,

    /// Dispute handler selector
    pub mode: u64,

    /// Human-readable event declaration, e.g. `event EventDispute(uint256 indexed channel)`
    pub event_abi: String,

    /// ABI-encoded filter specification: indexed-argument positions and values
    pub event_args: Bytes,

    /// Opaque bytes interpreted by the on-chain handler before response
    pub pre_condition: Bytes,

    /// Opaque bytes interpreted by the on-chain handler after response
    pub post_condition: Bytes,

    /// Commitment to the customer's payment
    pub payment_hash: B256,

    /// Customer's signature over the canonical encoding
    pub customer_signature: Bytes,
}

/// Non-unique customer-facing key: many appointments may share a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub customer_chosen_id: u64,
    pub customer_address: Address,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.customer_chosen_id, self.customer_address)
    }
}

/// Unique appointment identifier: locator plus job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppointmentId {
    pub locator: Locator,
    pub job_id: u64,
}

impl fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locator, self.job_id)
    }
}

/// Appointment lifecycle, tracked in memory and driven by the block stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentStatus {
    /// Admitted, not yet at `start_block`
    Pending,
    /// Inside the watch window and subscribed
    Active,
    /// Matching log seen; response enqueued
    Triggered,
    /// Response confirmed on-chain
    Completed,
    /// Window passed with no match
    Expired,
    /// Responder gave up; on-chain accountability is the customer's recourse
    Failed,
}

impl Appointment {
    /// The appointment's non-unique locator.
    pub fn locator(&self) -> Locator {
        Locator {
            customer_chosen_id: self.customer_chosen_id,
            customer_address: self.customer_address,
        }
    }

    /// The appointment's unique identifier.
    pub fn id(&self) -> AppointmentId {
        AppointmentId {
            locator: self.locator(),
            job_id: self.job_id,
        }
    }

    /// Canonical packed encoding used for the receipt signature.
    ///
    /// Fields are tightly concatenated in their ABI-packed form: addresses
    /// as 20 raw bytes, integers as 32-byte big-endian words, byte strings
    /// raw, the event declaration as UTF-8. `pre_condition` and the
    /// customer signature are not part of the encoding.
    pub fn packed_encoding(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(self.contract_address.as_slice());
        out.extend_from_slice(self.customer_address.as_slice());
        out.extend_from_slice(&word(self.start_block));
        out.extend_from_slice(&word(self.end_block));
        out.extend_from_slice(&word(self.challenge_period));
        out.extend_from_slice(&word(self.customer_chosen_id));
        out.extend_from_slice(&word(self.job_id));
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.refund.to_be_bytes::<32>());
        out.extend_from_slice(&word(self.gas_limit));
        out.extend_from_slice(&word(self.mode));
        out.extend_from_slice(self.event_abi.as_bytes());
        out.extend_from_slice(&self.event_args);
        out.extend_from_slice(&self.post_condition);
        out.extend_from_slice(self.payment_hash.as_slice());
        out
    }

    /// On-chain key under which a response is recorded.
    ///
    /// `keccak256(abi.encodePacked(sc, cus, customer_chosen_id, job_id))`.
    pub fn pisa_id(&self) -> B256 {
        let mut buf = Vec::with_capacity(20 + 20 + 32 + 32);
        buf.extend_from_slice(self.contract_address.as_slice());
        buf.extend_from_slice(self.customer_address.as_slice());
        buf.extend_from_slice(&word(self.customer_chosen_id));
        buf.extend_from_slice(&word(self.job_id));
        keccak256(&buf)
    }
}

fn word(value: u64) -> [u8; 32] {
    U256::from(value).to_be_bytes::<32>()
}

/// An accepted appointment together with the tower's receipt signature.
///
/// This is the shape persisted in the store and returned to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAppointment {
    #[serde(flatten)]
    pub appointment: Appointment,

    /// Detached 65-byte receipt signature
    pub signature: Bytes,
}

/// Serialize U256 as a decimal string so values above 2^53 survive JSON.
mod decimal_u256 {
    use alloy::primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<U256>()
            .map_err(|e| de::Error::custom(format!("invalid decimal integer {raw:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_appointment() -> Appointment {
        Appointment {
            contract_address: Address::repeat_byte(0x11),
            customer_address: Address::repeat_byte(0x22),
            start_block: 100,
            end_block: 200,
            challenge_period: 50,
            customer_chosen_id: 7,
            job_id: 1,
            data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            refund: U256::from(1_000_000_000_000_000_000u128),
            gas_limit: 400_000,
            mode: 0,
            event_abi: "event EventDispute(uint256 indexed channel, uint256 round)".to_string(),
            event_args: Bytes::new(),
            pre_condition: Bytes::new(),
            post_condition: Bytes::new(),
            payment_hash: free_tier_payment_hash(),
            customer_signature: Bytes::from(vec![0u8; 65]),
        }
    }

    #[test]
    fn test_id_and_locator_display() {
        let a = sample_appointment();
        let locator = a.locator().to_string();
        assert!(locator.starts_with("7:0x2222"));
        assert_eq!(a.id().to_string(), format!("{locator}:1"));
    }

    #[test]
    fn test_packed_encoding_layout() {
        let a = sample_appointment();
        let enc = a.packed_encoding();

        // 2 addresses + 5 words + data + word(refund) + 2 words + abi + hash
        let expected_len = 20
            + 20
            + 32 * 5
            + a.data.len()
            + 32
            + 32 * 2
            + a.event_abi.len()
            + a.event_args.len()
            + a.post_condition.len()
            + 32;
        assert_eq!(enc.len(), expected_len);

        assert_eq!(&enc[..20], a.contract_address.as_slice());
        assert_eq!(&enc[20..40], a.customer_address.as_slice());
        // start_block as a big-endian word
        assert_eq!(enc[40 + 31], 100);
        // payment hash trails the encoding
        assert_eq!(&enc[enc.len() - 32..], a.payment_hash.as_slice());
    }

    #[test]
    fn test_encoding_distinguishes_job_ids() {
        let a = sample_appointment();
        let mut b = a.clone();
        b.job_id = 2;
        assert_ne!(a.packed_encoding(), b.packed_encoding());
        assert_ne!(a.pisa_id(), b.pisa_id());
    }

    #[test]
    fn test_wire_round_trip() {
        let a = sample_appointment();
        let json = serde_json::to_string(&a).unwrap();
        // refund travels as a decimal string
        assert!(json.contains("\"1000000000000000000\""));
        let back: Appointment = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn test_signed_appointment_flattens() {
        let signed = SignedAppointment {
            appointment: sample_appointment(),
            signature: Bytes::from(vec![1u8; 65]),
        };
        let json = serde_json::to_value(&signed).unwrap();
        assert!(json.get("contract_address").is_some());
        assert!(json.get("signature").is_some());
        let back: SignedAppointment = serde_json::from_value(json).unwrap();
        assert_eq!(signed, back);
    }

    #[test]
    fn test_free_tier_constant() {
        assert_eq!(free_tier_payment_hash(), keccak256(b"on-the-house"));
    }
}
