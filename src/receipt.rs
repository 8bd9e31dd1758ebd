//! Receipt signing
//!
//! The receipt is the customer's evidence of hire: a detached ECDSA
//! signature binding the tower to the canonical appointment encoding and
//! the accountability contract address. On tower failure the customer
//! presents it on-chain to claim the refund bond.

use alloy::primitives::{
    eip191_hash_message, keccak256, Address, Bytes, PrimitiveSignature, B256,
};
use alloy::signers::{local::PrivateKeySigner, SignerSync};

use crate::appointment::Appointment;
use crate::error::{ConfigError, ProviderError, ValidationError};

/// Digest the receipt signature is produced over.
///
/// `keccak256("\x19Ethereum Signed Message:\n32" ‖ keccak256(encoding ‖ tower_address))`.
pub fn receipt_digest(appointment: &Appointment, tower_address: Address) -> B256 {
    let mut buf = appointment.packed_encoding();
    buf.extend_from_slice(tower_address.as_slice());
    eip191_hash_message(keccak256(&buf))
}

/// Produces detached receipt signatures under the tower's receipt key.
pub struct ReceiptSigner {
    signer: PrivateKeySigner,
    tower_address: Address,
}

impl ReceiptSigner {
    pub fn new(receipt_key: &str, tower_address: Address) -> Result<Self, ConfigError> {
        let signer: PrivateKeySigner = receipt_key
            .parse()
            .map_err(|_| ConfigError::InvalidPrivateKey)?;
        Ok(Self {
            signer,
            tower_address,
        })
    }

    /// Address customers verify receipts against.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// The accountability contract the receipts commit to.
    pub fn tower_address(&self) -> Address {
        self.tower_address
    }

    /// Sign the canonical encoding of an appointment. Returns 65 bytes r‖s‖v.
    pub fn sign(&self, appointment: &Appointment) -> Result<Bytes, ProviderError> {
        let digest = receipt_digest(appointment, self.tower_address);
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| ProviderError::Signing(e.to_string()))?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}

/// Recover the signer of a detached 65-byte receipt signature.
pub fn recover_receipt_signer(
    appointment: &Appointment,
    tower_address: Address,
    signature: &[u8],
) -> Result<Address, ValidationError> {
    let parsed = PrimitiveSignature::try_from(signature)
        .map_err(|e| ValidationError::BadCustomerSignature(e.to_string()))?;
    let digest = receipt_digest(appointment, tower_address);
    parsed
        .recover_address_from_prehash(&digest)
        .map_err(|e| ValidationError::BadCustomerSignature(e.to_string()))
}

/// Check that the customer signed the appointment they submitted.
pub fn verify_customer_signature(
    appointment: &Appointment,
    tower_address: Address,
) -> Result<(), ValidationError> {
    let recovered =
        recover_receipt_signer(appointment, tower_address, &appointment.customer_signature)?;
    if recovered != appointment.customer_address {
        return Err(ValidationError::BadCustomerSignature(format!(
            "recovered {recovered:#x}, expected {:#x}",
            appointment.customer_address
        )));
    }
    Ok(())
}
