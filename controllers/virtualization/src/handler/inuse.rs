//! `InUse` condition.
//!
//! Consumers are VMs with the object among their block devices, pending
//! attachments, and objects still being created from this one. The
//! condition is only computed once `Ready` settled for the current
//! generation.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crds::conditions::image::{ConditionType, InUseReason};
use crds::conditions::{ConditionBuilder, ConditionStatus, find_condition, is_last_updated, set_condition};
use crds::{
    BlockDeviceAttachmentPhase, BlockDeviceKind, ClusterVirtualImage, DataSourceType, VirtualDisk, VirtualImage,
    VirtualMachineBlockDeviceAttachment,
};

use super::attachee::device_key;
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::source::object_ref::ref_key;
use crate::store::ObjectKey;

/// Reports who uses the object.
#[derive(Debug)]
pub struct InUseHandler<K> {
    ctx: Arc<Context>,
    kind: PhantomData<fn() -> K>,
}

impl<K> InUseHandler<K> {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, kind: PhantomData }
    }
}

/// Returns true if `consumer` is created from `target`.
fn references<C: Provisionable, K: Provisionable>(consumer: &C, target: &K) -> bool {
    let source = consumer.data_source();
    let Some(r) = source.object_ref.as_ref() else {
        return false;
    };
    if source.type_ != DataSourceType::ObjectRef
        || r.kind != K::OBJECT_REF_KIND
        || target.meta().name.as_ref() != Some(&r.name)
    {
        return false;
    }
    match target.meta().namespace.as_deref() {
        None => true,
        Some(ns) => ref_key(consumer, r).is_ok_and(|k| k.namespace.as_deref() == Some(ns)),
    }
}

/// Describes a group of consumers of one kind.
fn describe(target_kind: &str, consumer_kind: &str, consumers: &[ObjectKey]) -> String {
    let names = || consumers.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    let vm = consumer_kind == "VirtualMachine";
    match (consumers.len(), vm) {
        (1, true) => format!("the {target_kind} is currently attached to the {consumer_kind} {}", consumers[0]),
        (2 | 3, true) => format!("the {target_kind} is currently attached to the {consumer_kind}s: {}", names()),
        (n, true) => format!("{n} {consumer_kind}s are using the {target_kind}"),
        (1, false) => format!(
            "the {target_kind} is currently being used to create the {consumer_kind} {}",
            consumers[0]
        ),
        (2 | 3, false) => format!(
            "the {target_kind} is currently being used to create the {consumer_kind}s: {}",
            names()
        ),
        (n, false) => format!("the {target_kind} is currently used to create {n} {consumer_kind}s"),
    }
}

fn describe_namespaces(target_kind: &str, namespaces: &BTreeSet<String>) -> String {
    match namespaces.len() {
        1 => format!(
            "{target_kind} is currently using in Namespace {}",
            namespaces.iter().next().map(String::as_str).unwrap_or_default()
        ),
        2 | 3 => format!(
            "{target_kind} is currently using in Namespaces: {}",
            namespaces.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
        ),
        n => format!("{target_kind} is currently using in {n} Namespaces"),
    }
}

impl<K: Provisionable> InUseHandler<K> {
    /// VMs using the object or about to get it hotplugged.
    async fn virtual_machines(&self, obj: &K) -> Result<BTreeSet<ObjectKey>, ControllerError> {
        let mut vms: BTreeSet<ObjectKey> = self.ctx.index.vms_using(&device_key(obj)).into_iter().collect();

        let name = obj.meta().name.as_deref().unwrap_or_default();
        let namespace = obj.meta().namespace.as_deref();
        let attachments: Vec<VirtualMachineBlockDeviceAttachment> = self.ctx.store.list(namespace).await?;
        for vmbda in attachments {
            let pending = vmbda
                .status
                .as_ref()
                .is_none_or(|s| s.phase != BlockDeviceAttachmentPhase::Attached);
            let r = &vmbda.spec.block_device_ref;
            if pending && BlockDeviceKind::from(r.kind) == K::BLOCK_DEVICE_KIND && r.name == name {
                let vm_namespace = vmbda.metadata.namespace.clone().unwrap_or_default();
                vms.insert(ObjectKey::namespaced(vm_namespace, vmbda.spec.virtual_machine_name.clone()));
            }
        }
        Ok(vms)
    }

    /// Objects of kind `C` not yet Ready that are created from the object.
    async fn pending_consumers<C: Provisionable>(&self, obj: &K) -> Result<Vec<ObjectKey>, ControllerError> {
        let items: Vec<C> = self.ctx.store.list(None).await?;
        Ok(items
            .iter()
            .filter(|c| c.phase() != Phase::Ready && references(*c, obj))
            .map(ObjectKey::of)
            .collect())
    }
}

#[async_trait]
impl<K: Provisionable> Handler<K> for InUseHandler<K> {
    fn name(&self) -> &'static str {
        "inuse"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        let generation = meta::generation(obj);
        let cb = ConditionBuilder::new(ConditionType::InUse).generation(generation);

        let settled = find_condition(obj.conditions(), ConditionType::Ready.as_str())
            .is_some_and(|c| c.status != ConditionStatus::Unknown && is_last_updated(c, generation));
        if !settled {
            set_condition(obj.conditions_mut(), cb.status(ConditionStatus::Unknown).build());
            obj.set_used_in_namespaces(Vec::new());
            return Ok(HandlerOutcome::proceed());
        }

        let target_kind = K::kind(&()).to_string();
        let vms: Vec<ObjectKey> = self.virtual_machines(obj).await?.into_iter().collect();
        let groups = [
            ("VirtualMachine", vms),
            ("VirtualDisk", self.pending_consumers::<VirtualDisk>(obj).await?),
            ("VirtualImage", self.pending_consumers::<VirtualImage>(obj).await?),
            ("ClusterVirtualImage", self.pending_consumers::<ClusterVirtualImage>(obj).await?),
        ];

        let namespaces: BTreeSet<String> = groups
            .iter()
            .flat_map(|(_, keys)| keys.iter())
            .filter_map(|k| k.namespace.clone())
            .collect();
        let mut parts: Vec<String> = groups
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(kind, keys)| describe(&target_kind, kind, keys))
            .collect();

        if parts.is_empty() {
            let condition = cb
                .status(ConditionStatus::False)
                .reason(InUseReason::NotInUse)
                .clear_message()
                .build();
            set_condition(obj.conditions_mut(), condition);
            obj.set_used_in_namespaces(Vec::new());
            return Ok(HandlerOutcome::proceed());
        }

        if !namespaces.is_empty() {
            parts.push(describe_namespaces(&target_kind, &namespaces));
        }
        let condition = cb
            .status(ConditionStatus::True)
            .reason(InUseReason::InUse)
            .message(format!("{}.", parts.join(", ")))
            .build();
        set_condition(obj.conditions_mut(), condition);
        obj.set_used_in_namespaces(namespaces.into_iter().collect());

        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::set_ready;
    use crate::test_utils::{create_test_cvi, create_test_vi, create_test_vm, test_context};
    use crds::conditions::image::ReadyReason;
    use crds::{BlockDeviceStatusRef, DataSourceObjectRef, ObjectRefKind, VirtualMachineStatus};

    fn ready_cvi() -> ClusterVirtualImage {
        let mut cvi = create_test_cvi("ubuntu");
        cvi.set_phase(Phase::Ready);
        set_ready(&mut cvi, ConditionStatus::True, ReadyReason::Ready, "");
        cvi
    }

    fn attach(ctx: &Context, vm_name: &str) {
        let mut vm = create_test_vm(vm_name, "ns");
        vm.status = Some(VirtualMachineStatus {
            block_device_refs: vec![BlockDeviceStatusRef {
                kind: BlockDeviceKind::ClusterVirtualImage,
                name: "ubuntu".to_string(),
                size: String::new(),
                target: String::new(),
                attached: true,
                hotplugged: false,
                virtual_machine_block_device_attachment_name: String::new(),
            }],
            ..Default::default()
        });
        ctx.index.upsert_vm(&vm);
    }

    fn in_use_message(cvi: &ClusterVirtualImage) -> String {
        let condition = find_condition(cvi.conditions(), "InUse").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        condition.message.clone()
    }

    #[tokio::test]
    async fn test_single_vm_message() {
        let (ctx, _, _) = test_context();
        attach(&ctx, "name");
        let mut cvi = ready_cvi();

        InUseHandler::new(Arc::clone(&ctx)).handle(&mut cvi).await.unwrap();

        assert_eq!(
            in_use_message(&cvi),
            "The ClusterVirtualImage is currently attached to the VirtualMachine ns/name, \
             ClusterVirtualImage is currently using in Namespace ns."
        );
        assert_eq!(cvi.status.unwrap().used_in_namespaces, vec!["ns".to_string()]);
    }

    #[tokio::test]
    async fn test_many_vms_message() {
        let (ctx, _, _) = test_context();
        for i in 0..5 {
            attach(&ctx, &format!("vm-{i}"));
        }
        let mut cvi = ready_cvi();

        InUseHandler::new(Arc::clone(&ctx)).handle(&mut cvi).await.unwrap();

        assert_eq!(
            in_use_message(&cvi),
            "5 VirtualMachines are using the ClusterVirtualImage, \
             ClusterVirtualImage is currently using in Namespace ns."
        );
    }

    #[tokio::test]
    async fn test_pending_image_created_from_cvi() {
        let (ctx, backend, _) = test_context();
        let mut vi = create_test_vi("copy", "team");
        vi.spec.data_source.type_ = DataSourceType::ObjectRef;
        vi.spec.data_source.object_ref = Some(DataSourceObjectRef {
            kind: ObjectRefKind::ClusterVirtualImage,
            name: "ubuntu".to_string(),
            namespace: None,
        });
        backend.seed(&vi);
        let mut cvi = ready_cvi();

        InUseHandler::new(Arc::clone(&ctx)).handle(&mut cvi).await.unwrap();

        assert_eq!(
            in_use_message(&cvi),
            "The ClusterVirtualImage is currently being used to create the VirtualImage team/copy, \
             ClusterVirtualImage is currently using in Namespace team."
        );
    }

    #[tokio::test]
    async fn test_unused_image() {
        let (ctx, _, _) = test_context();
        let mut cvi = ready_cvi();

        InUseHandler::new(ctx).handle(&mut cvi).await.unwrap();

        let condition = find_condition(cvi.conditions(), "InUse").unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "NotInUse");
    }

    #[tokio::test]
    async fn test_unknown_until_ready_settles() {
        let (ctx, _, _) = test_context();
        attach(&ctx, "name");
        let mut cvi = ready_cvi();
        cvi.metadata.generation = Some(2);

        InUseHandler::new(ctx).handle(&mut cvi).await.unwrap();

        let condition = find_condition(cvi.conditions(), "InUse").unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert!(cvi.status.unwrap().used_in_namespaces.is_empty());
    }
}
