//! Agent commands and their Ed25519 signatures.
//!
//! A command is signed over its JSON encoding. The agent re-encodes the
//! received command and checks the signature against the key named by
//! `key_id` (first 16 hex chars of the SHA-256 of the verifying key).

use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use spotgrid_core::SharedClock;
use spotgrid_state::{InstanceId, Lifecycle, PoolKey};

use crate::error::SignatureError;

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Move the instance onto `target`, in `pool` when given.
    SwitchLifecycle {
        target: Lifecycle,
        pool: Option<PoolKey>,
    },
    /// Launch a standby for the instance.
    ProvisionReplica { pool: PoolKey, lifecycle: Lifecycle },
    /// Start copying state to the standby.
    StartSync { replica_instance_id: InstanceId },
    /// Move traffic and registration to the standby.
    RedirectTraffic { replica_instance_id: InstanceId },
    /// Terminate the instance.
    Terminate,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::SwitchLifecycle {
                target: Lifecycle::Spot,
                ..
            } => "switch_to_spot",
            ActionKind::SwitchLifecycle {
                target: Lifecycle::OnDemand,
                ..
            } => "switch_to_ondemand",
            ActionKind::ProvisionReplica { .. } => "provision_replica",
            ActionKind::StartSync { .. } => "start_sync",
            ActionKind::RedirectTraffic { .. } => "redirect_traffic",
            ActionKind::Terminate => "terminate",
        }
    }

    /// Lifecycle the instance ends up on if this succeeds.
    pub fn target_lifecycle(&self) -> Option<Lifecycle> {
        match self {
            ActionKind::SwitchLifecycle { target, .. } => Some(*target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub id: String,
    pub instance_id: InstanceId,
    pub action: ActionKind,
    /// Unix seconds; the agent rejects commands older than its window.
    pub issued_at: u64,
}

impl AgentCommand {
    pub fn new(instance_id: &str, action: ActionKind, issued_at: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            action,
            issued_at,
        }
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, SignatureError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A command as it travels over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommand {
    pub command: AgentCommand,
    #[serde(default)]
    pub key_id: Option<String>,
    /// Hex-encoded 64-byte Ed25519 signature.
    #[serde(default)]
    pub signature: Option<String>,
}

impl SignedCommand {
    pub fn unsigned(command: AgentCommand) -> Self {
        Self {
            command,
            key_id: None,
            signature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Succeeded,
    Failed,
    /// Signature or freshness check failed; nothing was executed.
    Rejected,
}

/// State of the instance after the agent acted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultingState {
    pub instance_id: InstanceId,
    pub lifecycle: Option<Lifecycle>,
    pub pool: Option<PoolKey>,
    /// `host:port`, for freshly provisioned replicas.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAck {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub state: Option<ResultingState>,
}

impl AgentAck {
    pub fn succeeded(command_id: &str, state: ResultingState) -> Self {
        Self {
            command_id: command_id.to_string(),
            status: AckStatus::Succeeded,
            detail: None,
            state: Some(state),
        }
    }

    pub fn failed(command_id: &str, status: AckStatus, detail: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            status,
            detail: Some(detail.into()),
            state: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Succeeded
    }
}

/// Short identifier for a verifying key.
pub fn key_id(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ── Signer ────────────────────────────────────────────────────────

/// Holds the control loop's signing key.
pub struct CommandSigner {
    key: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for CommandSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSigner")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl CommandSigner {
    pub fn new(key: SigningKey) -> Self {
        let key_id = key_id(&key.verifying_key());
        Self { key, key_id }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex_seed(seed: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(seed.trim()).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    /// Load a seed written by [`CommandSigner::write_seed`].
    pub fn load(path: &Path) -> Result<Self, SignatureError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_hex_seed(&content)
    }

    pub fn write_seed(&self, path: &Path) -> Result<(), SignatureError> {
        std::fs::write(path, format!("{}\n", hex::encode(self.key.to_bytes())))?;
        Ok(())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn sign(&self, command: AgentCommand) -> Result<SignedCommand, SignatureError> {
        let signature = self.key.sign(&command.signing_bytes()?);
        Ok(SignedCommand {
            command,
            key_id: Some(self.key_id.clone()),
            signature: Some(hex::encode(signature.to_bytes())),
        })
    }
}

// ── Verifier ──────────────────────────────────────────────────────

/// Agent-side check of incoming commands.
#[derive(Debug)]
pub struct CommandVerifier {
    keys: HashMap<String, VerifyingKey>,
    clock: SharedClock,
    max_age_secs: u64,
}

impl CommandVerifier {
    pub fn new(clock: SharedClock, max_age_secs: u64) -> Self {
        Self {
            keys: HashMap::new(),
            clock,
            max_age_secs,
        }
    }

    pub fn trust(mut self, key: VerifyingKey) -> Self {
        self.keys.insert(key_id(&key), key);
        self
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Oldest `issued_at` age accepted.
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs
    }

    pub fn verify(&self, signed: &SignedCommand) -> Result<(), SignatureError> {
        let (Some(id), Some(signature)) = (&signed.key_id, &signed.signature) else {
            return Err(SignatureError::Unsigned);
        };
        let key = self
            .keys
            .get(id)
            .ok_or_else(|| SignatureError::UnknownKey(id.clone()))?;

        let bytes = hex::decode(signature).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SignatureError::Malformed("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&bytes);

        key.verify(&signed.command.signing_bytes()?, &signature)
            .map_err(|_| SignatureError::Invalid)?;

        let age = self.clock.now().saturating_sub(signed.command.issued_at);
        if age > self.max_age_secs {
            return Err(SignatureError::Stale { age });
        }
        Ok(())
    }
}
