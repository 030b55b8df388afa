// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! RPC framework on top of the runtime: length-prefixed binary protocol,
//! typed method dispatch, a service registry with publish/subscribe, and a
//! discovering, load-balancing client pool.
//!
//! Call outcomes travel in-band as [`RpcResult`] values; a failed call is
//! data, not an `Err`, so application code can branch on [`RpcCode`]
//! without unwinding through the dispatch machinery.

mod client;
mod pool;
mod protocol;
mod registry;
mod route;
mod serializer;
mod server;
mod session;

pub use client::*;
pub use pool::*;
pub use protocol::*;
pub use registry::*;
pub use route::*;
pub use serializer::*;
pub use server::*;
pub use session::*;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::sync::CoMutex;

/// Reserved topic prefix: the registry publishes
/// `"[[rpc service subscribe]]" + service` with `(up, address)` payloads on
/// provider arrival and departure.
pub const SERVICE_SUBSCRIBE_PREFIX: &str = "[[rpc service subscribe]]";

/// Status of one RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::FromRepr)]
#[repr(u16)]
pub enum RpcCode {
    /// Call succeeded; the result value is present.
    Success = 0,
    /// Generic server-side failure.
    Fail = 1,
    /// Argument or return-value type mismatch during de/serialization.
    NoMatch = 2,
    /// Method not registered, or discovery found no provider.
    NoMethod = 3,
    /// The session closed before a response arrived.
    Closed = 4,
    /// The per-call deadline elapsed.
    Timeout = 5,
}

/// Typed outcome of an RPC call. The value is present exactly when the
/// code is [`RpcCode::Success`].
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult<T> {
    code: RpcCode,
    msg: String,
    value: Option<T>,
}

impl<T> RpcResult<T> {
    pub fn success(value: T) -> Self {
        Self {
            code: RpcCode::Success,
            msg: "success".into(),
            value: Some(value),
        }
    }

    pub fn error(code: RpcCode, msg: impl Into<String>) -> Self {
        debug_assert!(code != RpcCode::Success, "errors need a non-zero code");
        Self {
            code,
            msg: msg.into(),
            value: None,
        }
    }

    #[must_use]
    pub fn code(&self) -> RpcCode {
        self.code
    }

    #[must_use]
    pub fn msg(&self) -> &str {
        &self.msg
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == RpcCode::Success
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T: Encode> Encode for RpcResult<T> {
    fn encode(&self, s: &mut Serializer) {
        s.write(&(self.code as u16));
        s.write(&self.msg);
        if self.code == RpcCode::Success {
            if let Some(value) = &self.value {
                s.write(value);
            }
        }
    }
}

impl<T: Decode> Decode for RpcResult<T> {
    fn decode(s: &mut Serializer) -> Result<Self, DecodeError> {
        let raw: u16 = s.read()?;
        let code = RpcCode::from_repr(raw).ok_or(DecodeError::InvalidValue)?;
        let msg: String = s.read()?;
        let value = if code == RpcCode::Success {
            Some(s.read()?)
        } else {
            None
        };
        Ok(Self { code, msg, value })
    }
}

/// topic -> non-owning session handles; shared by the server and the
/// registry, which both publish and both prune dead subscribers.
pub(crate) type SubscriberMap = CoMutex<HashMap<String, Vec<Weak<RpcSession>>>>;

/// Send `frame` to every live subscriber of `topic`, dropping dead weak
/// handles along the way.
pub(crate) async fn publish_to_subscribers(
    subscribers: &SubscriberMap,
    topic: &str,
    frame: &Protocol,
) {
    let live: Vec<Arc<RpcSession>> = {
        let mut map = subscribers.lock().await;
        let Some(entries) = map.get_mut(topic) else {
            return;
        };
        entries.retain(|weak| weak.upgrade().is_some_and(|s| s.is_connected()));
        entries.iter().filter_map(Weak::upgrade).collect()
    };
    for session in live {
        if let Err(error) = session.send_protocol(frame).await {
            tracing::debug!(topic, %error, "publish to subscriber failed");
        }
    }
}

/// Drop every subscription whose session is gone; the server and registry
/// run this periodically.
pub(crate) async fn prune_dead_subscribers(subscribers: &SubscriberMap) {
    let mut map = subscribers.lock().await;
    map.retain(|_, entries| {
        entries.retain(|weak| weak.upgrade().is_some_and(|s| s.is_connected()));
        !entries.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rpc_result_round_trip_success() {
        let mut s = Serializer::new();
        s.write(&RpcResult::success(444i32));
        s.reset();
        let back: RpcResult<i32> = s.read().unwrap();
        assert_eq!(back.code(), RpcCode::Success);
        assert_eq!(back.into_value(), Some(444));
    }

    #[test]
    fn rpc_result_error_has_no_value_on_the_wire() {
        let mut s = Serializer::new();
        s.write(&RpcResult::<String>::error(RpcCode::NoMethod, "nope"));
        s.reset();
        let back: RpcResult<String> = s.read().unwrap();
        assert_eq!(back.code(), RpcCode::NoMethod);
        assert_eq!(back.msg(), "nope");
        assert_eq!(back.value(), None);
    }

    #[test]
    fn codes_are_wire_stable() {
        assert_eq!(RpcCode::Success as u16, 0);
        assert_eq!(RpcCode::Fail as u16, 1);
        assert_eq!(RpcCode::NoMatch as u16, 2);
        assert_eq!(RpcCode::NoMethod as u16, 3);
        assert_eq!(RpcCode::Closed as u16, 4);
        assert_eq!(RpcCode::Timeout as u16, 5);
    }
}
