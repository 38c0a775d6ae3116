//! JSON-RPC method names used by chainmux, and the subscription method table.
//!
//! Each subscription is a triple: the method that registers it, the method
//! name carried by its notifications, and the method that cancels it. The
//! relay uses this table to recognise subscribe/unsubscribe calls coming from
//! apps; everything else is forwarded as a plain request.

/// Method names the multiplexer issues on its own behalf.
pub struct Methods;

impl Methods {
    pub const SYSTEM_HEALTH: &str = "system_health";
}

/// One subscribe / notification / unsubscribe triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionMethods {
    pub subscribe: &'static str,
    pub notification: &'static str,
    pub unsubscribe: &'static str,
}

const fn triple(
    subscribe: &'static str,
    notification: &'static str,
    unsubscribe: &'static str,
) -> SubscriptionMethods {
    SubscriptionMethods {
        subscribe,
        notification,
        unsubscribe,
    }
}

/// Every subscription the relay knows how to multiplex.
pub const SUBSCRIPTIONS: &[SubscriptionMethods] = &[
    // ── Chain ───────────────────────────────────────────────────────────
    triple("chain_subscribeNewHeads", "chain_newHead", "chain_unsubscribeNewHeads"),
    triple("chain_subscribeNewHead", "chain_newHead", "chain_unsubscribeNewHead"),
    triple("chain_subscribeAllHeads", "chain_allHead", "chain_unsubscribeAllHeads"),
    triple(
        "chain_subscribeFinalizedHeads",
        "chain_finalizedHead",
        "chain_unsubscribeFinalizedHeads",
    ),
    triple(
        "chain_subscribeFinalisedHeads",
        "chain_finalizedHead",
        "chain_unsubscribeFinalisedHeads",
    ),
    // ── State ───────────────────────────────────────────────────────────
    triple("state_subscribeStorage", "state_storage", "state_unsubscribeStorage"),
    triple(
        "state_subscribeRuntimeVersion",
        "state_runtimeVersion",
        "state_unsubscribeRuntimeVersion",
    ),
    // ── Author ──────────────────────────────────────────────────────────
    triple(
        "author_submitAndWatchExtrinsic",
        "author_extrinsicUpdate",
        "author_unwatchExtrinsic",
    ),
    // ── Grandpa ─────────────────────────────────────────────────────────
    triple(
        "grandpa_subscribeJustifications",
        "grandpa_justifications",
        "grandpa_unsubscribeJustifications",
    ),
    // ── New JSON-RPC API ────────────────────────────────────────────────
    triple(
        "chainHead_unstable_follow",
        "chainHead_unstable_followEvent",
        "chainHead_unstable_unfollow",
    ),
    triple(
        "transaction_unstable_submitAndWatch",
        "transaction_unstable_watchEvent",
        "transaction_unstable_unwatch",
    ),
];

/// Look up the triple registered by `method`, if it is a subscribe method.
pub fn by_subscribe(method: &str) -> Option<&'static SubscriptionMethods> {
    SUBSCRIPTIONS.iter().find(|s| s.subscribe == method)
}

/// Look up the triple cancelled by `method`, if it is an unsubscribe method.
pub fn by_unsubscribe(method: &str) -> Option<&'static SubscriptionMethods> {
    SUBSCRIPTIONS.iter().find(|s| s.unsubscribe == method)
}
