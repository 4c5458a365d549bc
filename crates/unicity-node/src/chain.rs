//! Genesis-only chain state.
//!
//! Header validation and storage live outside this binary; the node runs the
//! P2P engine against a chain that knows only its genesis header.

use parking_lot::RwLock;
use std::collections::HashSet;
use unicity_network::protocol::{BlockHash, NetworkType};
use unicity_network::ChainState;

const MAINNET_GENESIS: &str = "36de9b76dcd7899a52bab783f185c2563884afb4c6ee9f3b20a51e13a284cfa7";
const TESTNET_GENESIS: &str = "cb608755c4b2bee0b929fe5760dec6cc578b48976ee164bb06eb9597c17575f8";

pub fn genesis_hash(network: NetworkType) -> BlockHash {
    let hex = match network {
        NetworkType::Mainnet => MAINNET_GENESIS,
        NetworkType::Testnet => TESTNET_GENESIS,
        // Regtest genesis is mined locally; nothing to pin.
        NetworkType::Regtest => return BlockHash::ZERO,
    };
    BlockHash::from_hex(hex).unwrap_or(BlockHash::ZERO)
}

pub struct GenesisChain {
    genesis: BlockHash,
    known: RwLock<HashSet<BlockHash>>,
}

impl GenesisChain {
    pub fn new(network: NetworkType) -> Self {
        let genesis = genesis_hash(network);
        Self {
            genesis,
            known: RwLock::new(HashSet::from([genesis])),
        }
    }

    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }
}

impl ChainState for GenesisChain {
    fn current_height(&self) -> i32 {
        0
    }

    fn tip_hash(&self) -> BlockHash {
        self.genesis
    }

    fn has_block(&self, hash: &BlockHash) -> bool {
        self.known.read().contains(hash)
    }

    fn is_initial_block_download(&self) -> bool {
        true
    }
}
