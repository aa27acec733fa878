use prometheus::IntCounter;
use std::sync::LazyLock;

pub static SESSIONS_ESTABLISHED_SASL: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "s2s_out_sessions_sasl_external",
        "outgoing s2s sessions established via SASL EXTERNAL"
    )
    .unwrap()
});

pub static SESSIONS_ESTABLISHED_DIALBACK: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "s2s_out_sessions_dialback",
        "outgoing s2s sessions established via server dialback"
    )
    .unwrap()
});

pub static HANDSHAKE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "s2s_out_handshake_failures",
        "outgoing s2s establishment attempts that produced no session"
    )
    .unwrap()
});

pub static PIGGYBACK_AUTHENTICATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "s2s_out_piggyback_authentications",
        "domain pairs added to existing sessions via dialback piggybacking"
    )
    .unwrap()
});

pub static BOUNCES_GENERATED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "s2s_out_bounces",
        "stanzas bounced back to local senders as remote-server-not-found"
    )
    .unwrap()
});
