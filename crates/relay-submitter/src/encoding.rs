//! Settlement call encoding.

use alloy::sol;
use alloy::sol_types::SolCall;
use relay_types::{rat_to_u256, Address, Bytes, Ring, U256};

sol! {
	function submitRing(
		address[4][] addressList,
		uint256[6][] uintArgsList,
		uint8[1][] uint8ArgsList,
		bool[] buyNoMoreThanAmountBList,
		uint8[] vList,
		bytes32[] rList,
		bytes32[] sList,
		address feeRecipient,
		uint16 feeSelections
	);
}

/// ABI-encodes the ring for the protocol's `submitRing`.
///
/// Per order: `[owner, tokenS, wallet, auth]`,
/// `[amountS, amountB, validSince, validUntil, lrcFee, rateAmountS]` and
/// `[marginSplitPercentage]`, followed by the order signatures.
pub fn encode_submit_ring(ring: &Ring, fee_recipient: Address) -> Bytes {
	let orders = ring.orders.iter().map(|filled| (filled, filled.order()));

	let call = submitRingCall {
		addressList: orders
			.clone()
			.map(|(_, o)| [o.owner, o.token_s, o.wallet_address, o.auth_addr])
			.collect(),
		uintArgsList: orders
			.clone()
			.map(|(filled, o)| {
				[
					o.amount_s,
					o.amount_b,
					U256::from(o.valid_since),
					U256::from(o.valid_until),
					o.lrc_fee,
					rat_to_u256(&filled.rate_amount_s),
				]
			})
			.collect(),
		uint8ArgsList: orders
			.clone()
			.map(|(_, o)| [o.margin_split_percentage.min(100)])
			.collect(),
		buyNoMoreThanAmountBList: orders
			.clone()
			.map(|(_, o)| o.buy_no_more_than_amount_b)
			.collect(),
		vList: orders.clone().map(|(_, o)| o.v).collect(),
		rList: orders.clone().map(|(_, o)| o.r).collect(),
		sList: orders.map(|(_, o)| o.s).collect(),
		feeRecipient: fee_recipient,
		feeSelections: ring.fee_selections(),
	};

	Bytes::from(call.abi_encode())
}
