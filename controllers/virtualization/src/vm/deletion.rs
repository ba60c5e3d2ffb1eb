//! Cleanup finalizer of VirtualMachines.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crds::annotations::FINALIZER_VM_CLEANUP;

use super::Machine;
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::store::ObjectKey;

/// Holds the cleanup finalizer until the KubeVirt VirtualMachine is gone.
#[derive(Debug)]
pub struct DeletionHandler {
    ctx: Arc<Context>,
}

impl DeletionHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler<Machine> for DeletionHandler {
    fn name(&self) -> &'static str {
        "deletion"
    }

    async fn handle(&self, m: &mut Machine) -> Result<HandlerOutcome, ControllerError> {
        if !meta::is_deleting(&m.vm) {
            meta::add_finalizer(&mut m.vm, FINALIZER_VM_CLEANUP);
            return Ok(HandlerOutcome::proceed());
        }

        if let Some(kvvm) = m.kvvm.take() {
            if !meta::is_deleting(&kvvm) {
                info!("Deleting KubeVirt VirtualMachine {}", ObjectKey::of(&kvvm));
                self.ctx.store.delete_object(&kvvm).await?;
            }
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue()));
        }

        if meta::remove_finalizer(&mut m.vm, FINALIZER_VM_CLEANUP) {
            info!("Released VirtualMachine {}", ObjectKey::of(&m.vm));
        }
        self.ctx.index.remove_vm(&ObjectKey::of(&m.vm));
        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvm, create_test_vm, mark_deleting, test_context};
    use crds::kubevirt::KubeVirtVirtualMachine;
    use crds::{BlockDeviceKind, BlockDeviceSpecRef};
    use crate::index::BlockDeviceKey;

    #[tokio::test]
    async fn test_live_vm_gets_finalizer() {
        let (ctx, _, _) = test_context();
        let mut m = Machine::new(create_test_vm("web", "default"), None, None);

        DeletionHandler::new(ctx).handle(&mut m).await.unwrap();

        assert!(meta::has_finalizer(&m.vm, FINALIZER_VM_CLEANUP));
    }

    #[tokio::test]
    async fn test_kvvm_deleted_before_release() {
        let (ctx, backend, _) = test_context();
        let kvvm = create_test_kvvm("web", "default");
        backend.seed(&kvvm);
        let mut vm = create_test_vm("web", "default");
        meta::add_finalizer(&mut vm, FINALIZER_VM_CLEANUP);
        mark_deleting(&mut vm);
        let mut m = Machine::new(vm, Some(kvvm), None);
        let handler = DeletionHandler::new(Arc::clone(&ctx));

        let outcome = handler.handle(&mut m).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Continue(ReconcileResult::requeue()));
        assert!(meta::has_finalizer(&m.vm, FINALIZER_VM_CLEANUP));
        let stored: Option<KubeVirtVirtualMachine> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(stored.is_none());

        handler.handle(&mut m).await.unwrap();
        assert!(!meta::has_finalizer(&m.vm, FINALIZER_VM_CLEANUP));
    }

    #[tokio::test]
    async fn test_release_forgets_devices() {
        let (ctx, _, _) = test_context();
        let mut vm = create_test_vm("web", "default");
        vm.spec.block_device_refs.push(BlockDeviceSpecRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".to_string(),
        });
        ctx.index.upsert_vm(&vm);
        meta::add_finalizer(&mut vm, FINALIZER_VM_CLEANUP);
        mark_deleting(&mut vm);
        let mut m = Machine::new(vm, None, None);

        DeletionHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        let root = BlockDeviceKey::new(BlockDeviceKind::VirtualDisk, "default", "root");
        assert!(!ctx.index.is_used(&root));
    }
}
