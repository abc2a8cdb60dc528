//! Named RPC targets
//!
//! An RPC names a target object and a procedure; arguments travel as JSON
//! values. Handlers run outside every session lock.

use std::collections::HashMap;
use std::sync::Arc;

use matchsync_core::{SyncError, SyncResult, UserId};
use matchsync_wire::RpcCall;
use serde::de::DeserializeOwned;

pub type RpcHandler = Arc<dyn Fn(&UserId, &[serde_json::Value]) -> SyncResult<()> + Send + Sync>;

#[derive(Default)]
pub struct RpcRegistry {
    targets: HashMap<String, HashMap<String, RpcHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        RpcRegistry::default()
    }

    /// Register `name` on `object_id`, replacing any previous handler
    pub fn register(&mut self, object_id: impl Into<String>, name: impl Into<String>, handler: RpcHandler) {
        self.targets
            .entry(object_id.into())
            .or_default()
            .insert(name.into(), handler);
    }

    /// Register a handler whose arguments deserialize into `A`
    ///
    /// The argument list is read as a JSON array, so `A` is typically a
    /// tuple.
    pub fn register_typed<A, F>(&mut self, object_id: impl Into<String>, name: impl Into<String>, handler: F)
    where
        A: DeserializeOwned,
        F: Fn(&UserId, A) + Send + Sync + 'static,
    {
        self.register(
            object_id,
            name,
            Arc::new(move |sender: &UserId, args: &[serde_json::Value]| -> SyncResult<()> {
                let parsed: A = serde_json::from_value(serde_json::Value::Array(args.to_vec()))?;
                handler(sender, parsed);
                Ok(())
            }),
        );
    }

    /// Drop a whole target object
    pub fn unregister(&mut self, object_id: &str) -> bool {
        self.targets.remove(object_id).is_some()
    }

    pub fn contains(&self, object_id: &str, name: &str) -> bool {
        self.targets
            .get(object_id)
            .map_or(false, |t| t.contains_key(name))
    }

    pub fn handler(&self, call: &RpcCall) -> SyncResult<RpcHandler> {
        self.targets
            .get(&call.target_object_id)
            .and_then(|t| t.get(&call.name))
            .cloned()
            .ok_or_else(|| SyncError::UnknownRpcTarget {
                object_id: call.target_object_id.clone(),
                name: call.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn call(object: &str, name: &str, args: Vec<serde_json::Value>) -> RpcCall {
        RpcCall {
            name: name.into(),
            target_object_id: object.into(),
            args,
        }
    }

    #[test]
    fn test_unknown_target() {
        let registry = RpcRegistry::new();
        assert!(matches!(
            registry.handler(&call("door", "open", vec![])),
            Err(SyncError::UnknownRpcTarget { .. })
        ));
    }

    #[test]
    fn test_typed_handler() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut registry = RpcRegistry::new();
        registry.register_typed("door", "open", move |sender: &UserId, (speed, label): (f64, String)| {
            *sink.lock() = Some((sender.clone(), speed, label));
        });

        let rpc = call("door", "open", vec![json!(1.5), json!("front")]);
        registry.handler(&rpc).unwrap()(&UserId::new("a"), &rpc.args).unwrap();
        assert_eq!(*seen.lock(), Some((UserId::new("a"), 1.5, "front".to_string())));

        let bad = call("door", "open", vec![json!("fast")]);
        let result = registry.handler(&bad).unwrap()(&UserId::new("a"), &bad.args);
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }

    #[test]
    fn test_unregister() {
        let mut registry = RpcRegistry::new();
        registry.register("door", "open", Arc::new(|_: &UserId, _: &[serde_json::Value]| -> SyncResult<()> { Ok(()) }));
        assert!(registry.contains("door", "open"));
        assert!(registry.unregister("door"));
        assert!(!registry.contains("door", "open"));
    }
}
