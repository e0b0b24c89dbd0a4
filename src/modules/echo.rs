//! Echo module: the smoke-test workload.
//!
//! Two methods: a metadata round trip (`METHOD_MD`) echoing a number, and a
//! bulk round trip (`METHOD_IO`) checksumming a byte buffer. Both behave
//! identically whether served locally or replicated, which is exactly what
//! the cross-node tests assert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pool::{
    ContainerBase, ContainerModule, MonitorMode, PoolError, RegisteredModule, Result,
};
use crate::task::{MethodId, Task, METHOD_CREATE, METHOD_DESTROY, METHOD_USER};

pub const MODULE_NAME: &str = "echo";

/// Echo a number.
pub const METHOD_MD: MethodId = METHOD_USER;
/// Checksum a byte buffer.
pub const METHOD_IO: MethodId = METHOD_USER + 1;

/// Payload of `METHOD_MD`.
#[derive(Debug, Clone, Default)]
pub struct MdCall {
    pub x: u64,
    pub ret: u64,
}

impl MdCall {
    pub fn new(x: u64) -> Self {
        Self { x, ret: 0 }
    }
}

/// Payload of `METHOD_IO`. The buffer is shared between shallow copies and
/// duplicated for deep (data-owner) copies.
#[derive(Debug, Clone, Default)]
pub struct IoCall {
    pub data: Arc<Vec<u8>>,
    pub ret_size: usize,
    pub ret_sum: u64,
}

impl IoCall {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            ret_size: 0,
            ret_sum: 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IoOut {
    size: usize,
    sum: u64,
}

pub struct EchoContainer {
    base: ContainerBase,
    served: AtomicU64,
}

impl EchoContainer {
    fn new(base: ContainerBase) -> Self {
        Self {
            base,
            served: AtomicU64::new(0),
        }
    }

    /// Requests served by this container so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc.wrapping_add(*b as u64))
}

#[async_trait]
impl ContainerModule for EchoContainer {
    fn base(&self) -> &ContainerBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn run(&self, method: MethodId, task: &Arc<Task>) -> Result<()> {
        match method {
            METHOD_CREATE | METHOD_DESTROY => Ok(()),
            METHOD_MD => {
                self.served.fetch_add(1, Ordering::Relaxed);
                task.with_payload_mut::<MdCall, _>(|call| call.ret = call.x)
                    .ok_or(PoolError::BadPayload(method))?;
                task.set_module_complete();
                Ok(())
            }
            METHOD_IO => {
                self.served.fetch_add(1, Ordering::Relaxed);
                task.with_payload_mut::<IoCall, _>(|call| {
                    call.ret_size = call.data.len();
                    call.ret_sum = checksum(&call.data);
                })
                .ok_or(PoolError::BadPayload(method))?;
                task.set_module_complete();
                Ok(())
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }

    async fn monitor(
        &self,
        mode: MonitorMode,
        method: MethodId,
        task: &Arc<Task>,
        replicas: &[Arc<Task>],
    ) -> Result<()> {
        match mode {
            // Replicas are identical; the first one's outputs stand for all.
            MonitorMode::ReplicaAgg => match method {
                METHOD_MD => {
                    let ret = replicas
                        .first()
                        .and_then(|r| r.with_payload::<MdCall, _>(|call| call.ret));
                    if let Some(ret) = ret {
                        task.with_payload_mut::<MdCall, _>(|call| call.ret = ret);
                    }
                    Ok(())
                }
                METHOD_IO => {
                    let out = replicas.first().and_then(|r| {
                        r.with_payload::<IoCall, _>(|call| (call.ret_size, call.ret_sum))
                    });
                    if let Some((size, sum)) = out {
                        task.with_payload_mut::<IoCall, _>(|call| {
                            call.ret_size = size;
                            call.ret_sum = sum;
                        });
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            MonitorMode::Flush => {
                debug!(
                    container = self.base.container,
                    served = self.served(),
                    "Echo flush sweep"
                );
                Ok(())
            }
            MonitorMode::ReplicaStart => Ok(()),
        }
    }

    fn copy_start(&self, method: MethodId, from: &Task, to: &Task, deep: bool) -> Result<()> {
        match method {
            METHOD_MD => {
                let call = from
                    .with_payload::<MdCall, _>(Clone::clone)
                    .ok_or(PoolError::BadPayload(method))?;
                to.set_payload(call);
                Ok(())
            }
            METHOD_IO => {
                let mut call = from
                    .with_payload::<IoCall, _>(Clone::clone)
                    .ok_or(PoolError::BadPayload(method))?;
                if deep {
                    call.data = Arc::new(call.data.as_ref().clone());
                }
                to.set_payload(call);
                Ok(())
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }

    fn save_start(&self, method: MethodId, task: &Task) -> Result<Vec<u8>> {
        match method {
            METHOD_CREATE | METHOD_DESTROY => Ok(Vec::new()),
            METHOD_MD => {
                let x = task
                    .with_payload::<MdCall, _>(|call| call.x)
                    .ok_or(PoolError::BadPayload(method))?;
                Ok(rmp_serde::to_vec(&x)?)
            }
            METHOD_IO => {
                let bytes = task
                    .with_payload::<IoCall, _>(|call| call.data.as_ref().clone())
                    .ok_or(PoolError::BadPayload(method))?;
                Ok(rmp_serde::to_vec(&bytes)?)
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }

    fn load_start(&self, method: MethodId, task: &Task, bytes: &[u8]) -> Result<()> {
        match method {
            METHOD_CREATE | METHOD_DESTROY => Ok(()),
            METHOD_MD => {
                let x: u64 = rmp_serde::from_slice(bytes)?;
                task.set_payload(MdCall::new(x));
                Ok(())
            }
            METHOD_IO => {
                let data: Vec<u8> = rmp_serde::from_slice(bytes)?;
                task.set_payload(IoCall::new(data));
                Ok(())
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }

    fn save_end(&self, method: MethodId, task: &Task) -> Result<Vec<u8>> {
        match method {
            METHOD_CREATE | METHOD_DESTROY => Ok(Vec::new()),
            METHOD_MD => {
                let ret = task
                    .with_payload::<MdCall, _>(|call| call.ret)
                    .ok_or(PoolError::BadPayload(method))?;
                Ok(rmp_serde::to_vec(&ret)?)
            }
            METHOD_IO => {
                let out = task
                    .with_payload::<IoCall, _>(|call| IoOut {
                        size: call.ret_size,
                        sum: call.ret_sum,
                    })
                    .ok_or(PoolError::BadPayload(method))?;
                Ok(rmp_serde::to_vec(&out)?)
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }

    fn load_end(&self, method: MethodId, task: &Task, bytes: &[u8]) -> Result<()> {
        match method {
            METHOD_CREATE | METHOD_DESTROY => Ok(()),
            METHOD_MD => {
                let ret: u64 = rmp_serde::from_slice(bytes)?;
                task.with_payload_mut::<MdCall, _>(|call| call.ret = ret)
                    .ok_or(PoolError::BadPayload(method))?;
                Ok(())
            }
            METHOD_IO => {
                let out: IoOut = rmp_serde::from_slice(bytes)?;
                task.with_payload_mut::<IoCall, _>(|call| {
                    call.ret_size = out.size;
                    call.ret_sum = out.sum;
                })
                .ok_or(PoolError::BadPayload(method))?;
                Ok(())
            }
            other => Err(PoolError::UnknownMethod(other)),
        }
    }
}

inventory::submit! {
    RegisteredModule {
        name: MODULE_NAME,
        construct: |base| Arc::new(EchoContainer::new(base)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainQuery;
    use crate::task::{PoolId, TaskId, TaskNode, METHOD_FLUSH};

    fn container() -> EchoContainer {
        EchoContainer::new(ContainerBase::new(
            PoolId::new(1, 40),
            0,
            "echo".into(),
            1,
            8,
        ))
    }

    fn task(method: MethodId) -> Arc<Task> {
        Task::new(
            TaskNode::root(TaskId::new(1, 1)),
            PoolId::new(1, 40),
            method,
            DomainQuery::local_id(0),
        )
    }

    #[tokio::test]
    async fn test_md_echoes() {
        let echo = container();
        let task = task(METHOD_MD);
        task.set_payload(MdCall::new(42));

        echo.run(METHOD_MD, &task).await.unwrap();
        assert!(task.is_module_complete());
        assert_eq!(task.with_payload::<MdCall, _>(|c| c.ret), Some(42));
        assert_eq!(echo.served(), 1);
    }

    #[tokio::test]
    async fn test_io_checksums() {
        let echo = container();
        let task = task(METHOD_IO);
        task.set_payload(IoCall::new(vec![1, 2, 3, 4]));

        echo.run(METHOD_IO, &task).await.unwrap();
        let (size, sum) = task
            .with_payload::<IoCall, _>(|c| (c.ret_size, c.ret_sum))
            .unwrap();
        assert_eq!(size, 4);
        assert_eq!(sum, 10);
    }

    #[tokio::test]
    async fn test_missing_payload_is_an_error() {
        let echo = container();
        let task = task(METHOD_MD);
        let err = echo.run(METHOD_MD, &task).await.unwrap_err();
        assert!(matches!(err, PoolError::BadPayload(_)));
    }

    #[tokio::test]
    async fn test_flush_monitor_accepts_probe() {
        let echo = container();
        let probe = task(METHOD_FLUSH);
        probe.set_flush();
        echo.monitor(MonitorMode::Flush, METHOD_FLUSH, &probe, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error() {
        let echo = container();
        let task = task(999);
        let err = echo.run(999, &task).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownMethod(999)));
    }

    #[test]
    fn test_input_save_load_round_trip() {
        let echo = container();
        let from = task(METHOD_IO);
        from.set_payload(IoCall::new(vec![9; 32]));

        let bytes = echo.save_start(METHOD_IO, &from).unwrap();
        let to = task(METHOD_IO);
        echo.load_start(METHOD_IO, &to, &bytes).unwrap();
        assert_eq!(
            to.with_payload::<IoCall, _>(|c| c.data.len()),
            Some(32)
        );
    }

    #[test]
    fn test_output_save_load_round_trip() {
        let echo = container();
        let done = task(METHOD_MD);
        done.set_payload(MdCall { x: 5, ret: 5 });

        let bytes = echo.save_end(METHOD_MD, &done).unwrap();
        let origin = task(METHOD_MD);
        origin.set_payload(MdCall::new(5));
        echo.load_end(METHOD_MD, &origin, &bytes).unwrap();
        assert_eq!(origin.with_payload::<MdCall, _>(|c| c.ret), Some(5));
    }

    #[test]
    fn test_shallow_copy_shares_deep_copy_duplicates() {
        let echo = container();
        let from = task(METHOD_IO);
        from.set_payload(IoCall::new(vec![7; 8]));

        let shallow = task(METHOD_IO);
        echo.copy_start(METHOD_IO, &from, &shallow, false).unwrap();
        let deep = task(METHOD_IO);
        echo.copy_start(METHOD_IO, &from, &deep, true).unwrap();

        let original = from.with_payload::<IoCall, _>(|c| Arc::clone(&c.data)).unwrap();
        let shared = shallow.with_payload::<IoCall, _>(|c| Arc::clone(&c.data)).unwrap();
        let owned = deep.with_payload::<IoCall, _>(|c| Arc::clone(&c.data)).unwrap();
        assert!(Arc::ptr_eq(&original, &shared));
        assert!(!Arc::ptr_eq(&original, &owned));
        assert_eq!(*owned, *original);
    }
}
