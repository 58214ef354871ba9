//! Dedup and failure cache for matched rings.
//!
//! Bridges the gap between an off-chain matching decision and on-chain
//! confirmation. For every ring handed to the submitter the cache records:
//!
//! - the ring itself, keyed by ring hash, as a set of (order, owner, token-S)
//!   members;
//! - per order, the fill amounts each pending ring consumes;
//! - per (owner, token-S), the orders currently holding pending fills.
//!
//! Failure counters for ring unique ids and orders live beside it and are
//! kept independently of the ring entry. None of the multi-key updates are
//! transactional; the matcher reconciles stale ring entries at startup.

use alloy::primitives::{Address, B256};
use num::{BigRational, Zero};
use relay_storage::{StorageError, StorageService};
use relay_types::{serde_rational, RingSubmitInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const RING_HASH_NS: &str = "matcher_ringhash";
const ORDER_HASH_NS: &str = "matcher_orderhash";
const OWNER_NS: &str = "matcher_owner";
const FAILED_RING_NS: &str = "failed_ring";
const FAILED_ORDER_NS: &str = "failed_order";
const RING_UNIQUE_ID_NS: &str = "ringhash_uniqid";
const SUBMIT_CURSOR_NS: &str = "submitringmethod";
const SUBMIT_CURSOR_ID: &str = "lastid";

/// Two days.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(86_400 * 2);

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Corrupt cache entry: {0}")]
	Corrupt(String),
}

/// Fill amounts one pending ring consumes from an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMatchedState {
	#[serde(with = "serde_rational")]
	pub filled_amount_s: BigRational,
	#[serde(with = "serde_rational")]
	pub filled_amount_b: BigRational,
}

/// One member of a cached ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingMember {
	order_hash: B256,
	owner: Address,
	token_s: Address,
}

impl RingMember {
	fn encode(&self) -> String {
		let mut bytes = Vec::with_capacity(32 + 20 + 20);
		bytes.extend_from_slice(self.order_hash.as_slice());
		bytes.extend_from_slice(self.owner.as_slice());
		bytes.extend_from_slice(self.token_s.as_slice());
		hex::encode(bytes)
	}

	fn decode(raw: &str) -> Result<Self, CacheError> {
		let bytes = hex::decode(raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
		if bytes.len() != 72 {
			return Err(CacheError::Corrupt(format!(
				"ring member has {} bytes",
				bytes.len()
			)));
		}
		Ok(Self {
			order_hash: B256::from_slice(&bytes[..32]),
			owner: Address::from_slice(&bytes[32..52]),
			token_s: Address::from_slice(&bytes[52..]),
		})
	}
}

fn hex_id(hash: &B256) -> String {
	format!("{:#x}", hash)
}

fn owner_id(owner: &Address, token_s: &Address) -> String {
	format!("{:#x}_{:#x}", owner, token_s)
}

fn parse_hash(raw: &str) -> Result<B256, CacheError> {
	raw.parse::<B256>()
		.map_err(|e| CacheError::Corrupt(format!("bad hash '{}': {}", raw, e)))
}

pub struct DedupCache {
	storage: Arc<StorageService>,
	ttl: Duration,
}

impl DedupCache {
	pub fn new(storage: Arc<StorageService>, ttl: Duration) -> Self {
		Self { storage, ttl }
	}

	/// Records a ring handed to the submitter.
	pub async fn add_mined_ring(&self, info: &RingSubmitInfo) -> Result<(), CacheError> {
		let ring_id = hex_id(&info.ring_hash);
		let ttl = Some(self.ttl);
		let mut members = Vec::with_capacity(info.raw_ring.orders.len());

		for filled in &info.raw_ring.orders {
			let order = filled.order();
			let member = RingMember {
				order_hash: order.hash,
				owner: order.owner,
				token_s: order.token_s,
			};
			members.push(member.encode());

			let state = OrderMatchedState {
				filled_amount_s: filled.fill_amount_s.clone(),
				filled_amount_b: filled.fill_amount_b.clone(),
			};
			self.storage
				.hash_set(ORDER_HASH_NS, &hex_id(&order.hash), &ring_id, &state, ttl)
				.await?;
			self.storage
				.set_add(
					OWNER_NS,
					&owner_id(&order.owner, &order.token_s),
					&[hex_id(&order.hash)],
					ttl,
				)
				.await?;
		}

		self.storage
			.set_add(RING_HASH_NS, &ring_id, &members, ttl)
			.await?;
		self.storage
			.store_with_ttl(RING_UNIQUE_ID_NS, &ring_id, &hex_id(&info.unique_id), ttl)
			.await?;

		debug!(ring_hash = %info.ring_hash, orders = members.len(), "Cached mined ring");
		Ok(())
	}

	pub async fn is_ring_cached(&self, ring_hash: &B256) -> Result<bool, CacheError> {
		Ok(self.storage.exists(RING_HASH_NS, &hex_id(ring_hash)).await?)
	}

	/// Drops a ring from the active indices and returns its order hashes.
	///
	/// An order leaves its owner index only once no other cached ring still
	/// holds a fill on it.
	pub async fn remove_mined_ring(&self, ring_hash: &B256) -> Result<Vec<B256>, CacheError> {
		let ring_id = hex_id(ring_hash);
		let ttl = Some(self.ttl);
		let raw_members = self.storage.set_members(RING_HASH_NS, &ring_id).await?;

		let mut order_hashes = Vec::with_capacity(raw_members.len());
		for raw in raw_members {
			let member = RingMember::decode(&raw)?;
			let order_id = hex_id(&member.order_hash);
			order_hashes.push(member.order_hash);

			self.storage
				.hash_del(ORDER_HASH_NS, &order_id, &ring_id, ttl)
				.await?;
			if !self.storage.exists(ORDER_HASH_NS, &order_id).await? {
				self.storage
					.set_remove(
						OWNER_NS,
						&owner_id(&member.owner, &member.token_s),
						&order_id,
						ttl,
					)
					.await?;
			}
		}

		self.storage.remove(RING_HASH_NS, &ring_id).await?;
		debug!(ring_hash = %ring_hash, "Removed mined ring from cache");
		Ok(order_hashes)
	}

	/// Amounts of an order consumed by rings not yet confirmed on chain.
	pub async fn dealt_amount(
		&self,
		order_hash: &B256,
	) -> Result<(BigRational, BigRational), CacheError> {
		let states = self
			.storage
			.hash_values::<OrderMatchedState>(ORDER_HASH_NS, &hex_id(order_hash))
			.await?;
		Ok(states.values().fold(
			(BigRational::zero(), BigRational::zero()),
			|(s, b), state| (s + &state.filled_amount_s, b + &state.filled_amount_b),
		))
	}

	/// Token-S amount of an owner committed to pending rings.
	pub async fn filled_amount_s(
		&self,
		owner: &Address,
		token_s: &Address,
	) -> Result<BigRational, CacheError> {
		let order_ids = self
			.storage
			.set_members(OWNER_NS, &owner_id(owner, token_s))
			.await?;
		let mut total = BigRational::zero();
		for order_id in order_ids {
			let (dealt_s, _) = self.dealt_amount(&parse_hash(&order_id)?).await?;
			total += dealt_s;
		}
		Ok(total)
	}

	pub async fn cached_ring_hashes(&self) -> Result<Vec<B256>, CacheError> {
		self.storage
			.list_ids(RING_HASH_NS)
			.await?
			.iter()
			.map(|id| parse_hash(id))
			.collect()
	}

	pub async fn unique_id_of_ring(&self, ring_hash: &B256) -> Result<Option<B256>, CacheError> {
		match self
			.storage
			.retrieve_optional::<String>(RING_UNIQUE_ID_NS, &hex_id(ring_hash))
			.await?
		{
			Some(raw) => Ok(Some(parse_hash(&raw)?)),
			None => Ok(None),
		}
	}

	/// Counts one failed submission against the ring and each of its orders.
	pub async fn add_failed_ring(
		&self,
		unique_id: &B256,
		tx_hash: &B256,
		order_hashes: &[B256],
	) -> Result<(), CacheError> {
		let ttl = Some(self.ttl);
		self.storage
			.set_add(FAILED_RING_NS, &hex_id(unique_id), &[hex_id(tx_hash)], ttl)
			.await?;
		for order_hash in order_hashes {
			self.storage
				.set_add(FAILED_ORDER_NS, &hex_id(order_hash), &[hex_id(unique_id)], ttl)
				.await?;
		}
		debug!(unique_id = %unique_id, tx_hash = %tx_hash, "Recorded failed ring");
		Ok(())
	}

	pub async fn ring_failed_count(&self, unique_id: &B256) -> Result<usize, CacheError> {
		Ok(self
			.storage
			.set_card(FAILED_RING_NS, &hex_id(unique_id))
			.await?)
	}

	pub async fn order_failed_count(&self, order_hash: &B256) -> Result<usize, CacheError> {
		Ok(self
			.storage
			.set_card(FAILED_ORDER_NS, &hex_id(order_hash))
			.await?)
	}

	/// Id of the last mined-record processed, zero before the first poll.
	pub async fn last_mined_record_id(&self) -> Result<u64, CacheError> {
		Ok(self
			.storage
			.retrieve_optional::<u64>(SUBMIT_CURSOR_NS, SUBMIT_CURSOR_ID)
			.await?
			.unwrap_or(0))
	}

	pub async fn set_last_mined_record_id(&self, id: u64) -> Result<(), CacheError> {
		Ok(self
			.storage
			.store(SUBMIT_CURSOR_NS, SUBMIT_CURSOR_ID, &id)
			.await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy::primitives::{Bytes, U256};
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{rat_from_int, FilledOrder, Order, OrderState, Ring};

	fn cache() -> DedupCache {
		DedupCache::new(
			Arc::new(StorageService::new(Box::new(MemoryStorage::new()))),
			DEFAULT_CACHE_TTL,
		)
	}

	fn filled(owner: u8, token_s: u8, token_b: u8, fill_s: i64, fill_b: i64) -> FilledOrder {
		let mut order = Order {
			protocol: Address::ZERO,
			delegate_address: Address::ZERO,
			auth_addr: Address::ZERO,
			wallet_address: Address::ZERO,
			token_s: Address::repeat_byte(token_s),
			token_b: Address::repeat_byte(token_b),
			amount_s: U256::from(1_000u64),
			amount_b: U256::from(1_000u64),
			valid_since: 0,
			valid_until: u64::MAX,
			lrc_fee: U256::ZERO,
			buy_no_more_than_amount_b: false,
			margin_split_percentage: 0,
			v: 0,
			r: B256::ZERO,
			s: B256::repeat_byte(owner),
			owner: Address::repeat_byte(owner),
			hash: B256::ZERO,
		};
		order.seal();
		let mut filled = FilledOrder::new(
			OrderState::new(order),
			rat_from_int(0),
			rat_from_int(1_000),
			Address::ZERO,
		);
		filled.fill_amount_s = rat_from_int(fill_s);
		filled.fill_amount_b = rat_from_int(fill_b);
		filled
	}

	fn submit_info(orders: Vec<FilledOrder>, seed: u8) -> RingSubmitInfo {
		let ring = Ring::new(orders);
		RingSubmitInfo {
			unique_id: ring.generate_unique_id(),
			ring_hash: B256::repeat_byte(seed),
			orders_count: ring.orders.len(),
			raw_ring: ring,
			protocol_address: Address::ZERO,
			protocol_data: Bytes::new(),
			protocol_gas: 0,
			protocol_gas_price: 0,
			miner: Address::ZERO,
			submit_tx_hash: None,
		}
	}

	#[tokio::test]
	async fn test_mined_ring_lifecycle() {
		let cache = cache();
		let a = filled(1, 0x0a, 0x0b, 100, 200);
		let b = filled(2, 0x0b, 0x0a, 200, 100);
		let order_a = a.hash();
		let info = submit_info(vec![a, b], 0x77);

		assert!(!cache.is_ring_cached(&info.ring_hash).await.unwrap());
		cache.add_mined_ring(&info).await.unwrap();
		assert!(cache.is_ring_cached(&info.ring_hash).await.unwrap());
		assert_eq!(cache.cached_ring_hashes().await.unwrap(), vec![info.ring_hash]);
		assert_eq!(
			cache.unique_id_of_ring(&info.ring_hash).await.unwrap(),
			Some(info.unique_id)
		);

		let (dealt_s, dealt_b) = cache.dealt_amount(&order_a).await.unwrap();
		assert_eq!(dealt_s, rat_from_int(100));
		assert_eq!(dealt_b, rat_from_int(200));
		assert_eq!(
			cache
				.filled_amount_s(&Address::repeat_byte(1), &Address::repeat_byte(0x0a))
				.await
				.unwrap(),
			rat_from_int(100)
		);

		let mut removed = cache.remove_mined_ring(&info.ring_hash).await.unwrap();
		removed.sort();
		assert_eq!(removed.len(), 2);
		assert!(removed.contains(&order_a));
		assert!(!cache.is_ring_cached(&info.ring_hash).await.unwrap());
		assert!(cache.dealt_amount(&order_a).await.unwrap().0.is_zero());
		assert!(cache
			.filled_amount_s(&Address::repeat_byte(1), &Address::repeat_byte(0x0a))
			.await
			.unwrap()
			.is_zero());
	}

	#[tokio::test]
	async fn test_fills_accumulate_across_rings() {
		let cache = cache();
		let first = submit_info(
			vec![filled(1, 0x0a, 0x0b, 100, 200), filled(2, 0x0b, 0x0a, 200, 100)],
			0x01,
		);
		let second = submit_info(
			vec![filled(1, 0x0a, 0x0b, 50, 100), filled(3, 0x0b, 0x0a, 100, 50)],
			0x02,
		);
		cache.add_mined_ring(&first).await.unwrap();
		cache.add_mined_ring(&second).await.unwrap();

		let owner = Address::repeat_byte(1);
		let token = Address::repeat_byte(0x0a);
		assert_eq!(
			cache.filled_amount_s(&owner, &token).await.unwrap(),
			rat_from_int(150)
		);

		// Removing one ring keeps the order indexed for the other
		cache.remove_mined_ring(&first.ring_hash).await.unwrap();
		assert_eq!(
			cache.filled_amount_s(&owner, &token).await.unwrap(),
			rat_from_int(50)
		);
	}

	#[tokio::test]
	async fn test_failure_counters() {
		let cache = cache();
		let unique_id = B256::repeat_byte(0x10);
		let order = B256::repeat_byte(0x20);

		assert_eq!(cache.ring_failed_count(&unique_id).await.unwrap(), 0);
		cache
			.add_failed_ring(&unique_id, &B256::repeat_byte(1), &[order])
			.await
			.unwrap();
		cache
			.add_failed_ring(&unique_id, &B256::repeat_byte(2), &[order])
			.await
			.unwrap();

		assert_eq!(cache.ring_failed_count(&unique_id).await.unwrap(), 2);
		// Same ring failing twice counts once per order
		assert_eq!(cache.order_failed_count(&order).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_submit_cursor() {
		let cache = cache();
		assert_eq!(cache.last_mined_record_id().await.unwrap(), 0);
		cache.set_last_mined_record_id(42).await.unwrap();
		assert_eq!(cache.last_mined_record_id().await.unwrap(), 42);
	}

	#[test]
	fn test_member_encoding() {
		let member = RingMember {
			order_hash: B256::repeat_byte(3),
			owner: Address::repeat_byte(4),
			token_s: Address::repeat_byte(5),
		};
		assert_eq!(RingMember::decode(&member.encode()).unwrap(), member);
		assert!(RingMember::decode("abcd").is_err());
	}
}
