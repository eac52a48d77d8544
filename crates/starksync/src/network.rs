//! Well-known L1 contracts per network.

use crate::client::{ClientError, L1Client};
use crate::feeder::{FeederClient, FeederError};
use crate::abi::parse_address;
use alloy::primitives::{address, Address};
use thiserror::Error;

/// First L1 block that can carry StarkNet state contract logs.
pub const MAINNET_DEPLOYMENT_BLOCK: u64 = 13_627_000;
pub const TESTNET_DEPLOYMENT_BLOCK: u64 = 5_853_000;

const MAINNET_GPS_VERIFIER: Address = address!("a739b175325cca7b71fcb51c3032935ef7ac338f");
const MAINNET_MEMORY_PAGE_REGISTRY: Address = address!("96375087b2f6efc59e5e0dd5111b4d090ebfdd8b");
const TESTNET_GPS_VERIFIER: Address = address!("5ef3c980bf970fce5bbc217835743ea9f0388f4f");
const TESTNET_MEMORY_PAGE_REGISTRY: Address = address!("743789ff2ff82bfb907009c9911a7da636d34fa7");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Chain id 1 is mainnet; every other chain uses the testnet deployment.
    pub fn from_chain_id(chain_id: u64) -> Self {
        if chain_id == 1 {
            Network::Mainnet
        } else {
            Network::Testnet
        }
    }

    pub fn deployment_block(self) -> u64 {
        match self {
            Network::Mainnet => MAINNET_DEPLOYMENT_BLOCK,
            Network::Testnet => TESTNET_DEPLOYMENT_BLOCK,
        }
    }

    pub fn gps_verifier(self) -> Address {
        match self {
            Network::Mainnet => MAINNET_GPS_VERIFIER,
            Network::Testnet => TESTNET_GPS_VERIFIER,
        }
    }

    pub fn memory_page_registry(self) -> Address {
        match self {
            Network::Mainnet => MAINNET_MEMORY_PAGE_REGISTRY,
            Network::Testnet => TESTNET_MEMORY_PAGE_REGISTRY,
        }
    }
}

/// Which contract emitted a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    /// StarkNet core (state) contract: LogStateTransitionFact.
    State,
    /// GPS statement verifier: LogMemoryPagesHashes.
    GpsVerifier,
    /// Memory page fact registry: LogMemoryPageFactContinuous.
    MemoryPageRegistry,
}

/// The three contracts the ingestion pipeline watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedContracts {
    pub state: Address,
    pub gps_verifier: Address,
    pub memory_page_registry: Address,
    /// Backfill never starts below this block.
    pub deployment_block: u64,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("L1 client: {0}")]
    Client(#[from] ClientError),
    #[error("feeder: {0}")]
    Feeder(#[from] FeederError),
    #[error("invalid state contract address {0:?}")]
    InvalidAddress(String),
}

impl WatchedContracts {
    pub fn for_network(network: Network, state: Address) -> Self {
        Self {
            state,
            gps_verifier: network.gps_verifier(),
            memory_page_registry: network.memory_page_registry(),
            deployment_block: network.deployment_block(),
        }
    }

    /// State contract from the feeder, the other two from the L1 chain id.
    pub async fn discover(
        l1: &dyn L1Client,
        feeder: &dyn FeederClient,
    ) -> Result<Self, DiscoveryError> {
        let chain_id = l1.chain_id().await?;
        let network = Network::from_chain_id(chain_id);
        let addresses = feeder.contract_addresses().await?;
        let state = parse_address(&addresses.starknet)
            .map_err(|_| DiscoveryError::InvalidAddress(addresses.starknet.clone()))?;
        let contracts = Self::for_network(network, state);
        tracing::info!(
            chain_id,
            ?network,
            state = %contracts.state,
            gps_verifier = %contracts.gps_verifier,
            memory_page_registry = %contracts.memory_page_registry,
            "discovered L1 contracts"
        );
        Ok(contracts)
    }

    pub fn addresses(&self) -> Vec<Address> {
        vec![self.state, self.gps_verifier, self.memory_page_registry]
    }

    pub fn kind_of(&self, address: &Address) -> Option<ContractKind> {
        if *address == self.state {
            Some(ContractKind::State)
        } else if *address == self.gps_verifier {
            Some(ContractKind::GpsVerifier)
        } else if *address == self.memory_page_registry {
            Some(ContractKind::MemoryPageRegistry)
        } else {
            None
        }
    }
}
