//! Protection finalizer of block devices in use.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::Context;
use crate::error::ControllerError;
use crate::index::BlockDeviceKey;
use crate::meta;
use crate::provisionable::Provisionable;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::store::ObjectKey;

/// Holds the protection finalizer while any VM references the object.
#[derive(Debug)]
pub struct AttacheeHandler<K> {
    ctx: Arc<Context>,
    kind: PhantomData<fn() -> K>,
}

impl<K> AttacheeHandler<K> {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, kind: PhantomData }
    }
}

/// Index key of a provisionable object.
pub fn device_key<K: Provisionable>(obj: &K) -> BlockDeviceKey {
    BlockDeviceKey::new(
        K::BLOCK_DEVICE_KIND,
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl<K: Provisionable> Handler<K> for AttacheeHandler<K> {
    fn name(&self) -> &'static str {
        "attachee"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        let used = self.ctx.index.is_used(&device_key(obj));

        if used {
            // A deleting object cannot gain finalizers.
            if !meta::is_deleting(obj) && meta::add_finalizer(obj, K::PROTECTION_FINALIZER) {
                debug!("Protected {} {}", K::kind(&()), ObjectKey::of(obj));
            }
        } else if meta::remove_finalizer(obj, K::PROTECTION_FINALIZER) {
            debug!("Unprotected {} {}", K::kind(&()), ObjectKey::of(obj));
        }

        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_vd, create_test_vm, mark_deleting, test_context};
    use crds::annotations::FINALIZER_VD_PROTECTION;
    use crds::{BlockDeviceKind, BlockDeviceSpecRef};

    #[tokio::test]
    async fn test_protection_follows_vm_references() {
        let (ctx, _, _) = test_context();
        let handler = AttacheeHandler::new(Arc::clone(&ctx));
        let mut vd = create_test_vd("root", "default");
        let mut vm = create_test_vm("web", "default");
        vm.spec.block_device_refs.push(BlockDeviceSpecRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".to_string(),
        });
        ctx.index.upsert_vm(&vm);

        handler.handle(&mut vd).await.unwrap();
        assert!(meta::has_finalizer(&vd, FINALIZER_VD_PROTECTION));

        ctx.index.remove_vm(&ObjectKey::of(&vm));
        handler.handle(&mut vd).await.unwrap();
        assert!(!meta::has_finalizer(&vd, FINALIZER_VD_PROTECTION));
    }

    #[tokio::test]
    async fn test_disk_in_another_namespace_is_not_protected() {
        let (ctx, _, _) = test_context();
        let handler = AttacheeHandler::new(Arc::clone(&ctx));
        let mut vd = create_test_vd("root", "other");
        let mut vm = create_test_vm("web", "default");
        vm.spec.block_device_refs.push(BlockDeviceSpecRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".to_string(),
        });
        ctx.index.upsert_vm(&vm);

        handler.handle(&mut vd).await.unwrap();

        assert!(!meta::has_finalizer(&vd, FINALIZER_VD_PROTECTION));
    }

    #[tokio::test]
    async fn test_deleting_disk_does_not_gain_protection() {
        let (ctx, _, _) = test_context();
        let handler = AttacheeHandler::new(Arc::clone(&ctx));
        let mut vd = create_test_vd("root", "default");
        mark_deleting(&mut vd);
        let mut vm = create_test_vm("web", "default");
        vm.spec.block_device_refs.push(BlockDeviceSpecRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".to_string(),
        });
        ctx.index.upsert_vm(&vm);

        handler.handle(&mut vd).await.unwrap();

        assert!(!meta::has_finalizer(&vd, FINALIZER_VD_PROTECTION));
    }
}
