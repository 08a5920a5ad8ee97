//! Device registry
//!
//! One [`Device`] exists per RDMA adapter that has at least one connection.
//! It owns the protection domain, the completion-queue pairs with their
//! workers, the global DMA memory region and the per-queue load counters
//! used to place new queue pairs. Devices are shared through reference
//! counting; the last [`Device`] handle to go away tears the adapter
//! resources down and removes the registry entry.

use crate::config::{CompletionMode, TransportConfig};
use crate::connection::ConnInner;
use crate::error::{IsertError, IsertResult};
use crate::registration::RegStrategy;
use crate::verbs::{
    access, lock, AdapterId, CmId, CqHandle, CqNotifier, DeviceAttr, DmaDirection, DmaSegment,
    HostBuffer, MrKeys, PdHandle, QpInitAttr, QpNum, Verbs,
};
use crate::worker::{CqWorker, WorkerMsg};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Queue pairs served by a device, for routing completions
pub(crate) type QpTable = RwLock<HashMap<QpNum, Weak<ConnInner>>>;

/// Registry of devices keyed by adapter identity
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    verbs: Arc<dyn Verbs>,
    config: TransportConfig,
    devices: Mutex<HashMap<AdapterId, Weak<DeviceInner>>>,
}

impl DeviceRegistry {
    pub fn new(verbs: Arc<dyn Verbs>, config: TransportConfig) -> Self {
        DeviceRegistry {
            inner: Arc::new(RegistryInner { verbs, config, devices: Mutex::new(HashMap::new()) }),
        }
    }

    /// Look up the device for an adapter, creating it on first use
    pub fn find_or_create(&self, adapter: AdapterId) -> IsertResult<Device> {
        let mut devices = lock(&self.inner.devices);
        if let Some(inner) = devices.get(&adapter).and_then(Weak::upgrade) {
            log::debug!(
                "Reusing device {:#x}, refcount {}",
                adapter,
                Arc::strong_count(&inner)
            );
            return Ok(Device { inner });
        }

        let inner = Arc::new(DeviceInner::create(&self.inner, adapter)?);
        devices.insert(adapter, Arc::downgrade(&inner));
        Ok(Device { inner })
    }

    /// Existing device for an adapter, if any connection holds it
    pub fn get(&self, adapter: AdapterId) -> Option<Device> {
        lock(&self.inner.devices)
            .get(&adapter)
            .and_then(Weak::upgrade)
            .map(|inner| Device { inner })
    }

    /// Number of live devices
    pub fn device_count(&self) -> usize {
        lock(&self.inner.devices).values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Shared handle to an adapter's resources
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    registry: Arc<RegistryInner>,
    adapter: AdapterId,
    attr: DeviceAttr,
    strategy: RegStrategy,
    cq_pairs: Vec<Arc<CqPair>>,
    /// Queue pairs per completion-queue pair; mutated under the registry lock
    cq_load: Vec<AtomicUsize>,
    qps: Arc<QpTable>,
    workers: Mutex<Vec<CqWorker>>,
    resources: DeviceResources,
}

/// Completion-queue pair drained by one worker
pub(crate) struct CqPair {
    pub(crate) index: usize,
    pub(crate) rx_cq: CqHandle,
    pub(crate) tx_cq: CqHandle,
    pub(crate) verbs: Arc<dyn Verbs>,
    pub(crate) qps: Arc<QpTable>,
    pub(crate) drain_lock: Mutex<()>,
}

/// Adapter objects, destroyed in reverse order of creation
struct DeviceResources {
    verbs: Arc<dyn Verbs>,
    pd: Option<PdHandle>,
    dma_mr: Option<MrKeys>,
    cqs: Vec<CqHandle>,
}

impl Drop for DeviceResources {
    fn drop(&mut self) {
        for cq in self.cqs.drain(..).rev() {
            self.verbs.destroy_cq(cq);
        }
        if let Some(mr) = self.dma_mr.take() {
            self.verbs.dereg_mr(mr.handle);
        }
        if let Some(pd) = self.pd.take() {
            self.verbs.dealloc_pd(pd);
        }
    }
}

impl DeviceInner {
    fn create(registry: &Arc<RegistryInner>, adapter: AdapterId) -> IsertResult<Self> {
        let verbs = Arc::clone(&registry.verbs);
        let config = &registry.config;
        let attr = verbs.query_device(adapter)?;

        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let cq_count = cpus
            .min(attr.num_comp_vectors as usize)
            .min(config.max_cq)
            .max(1);
        let strategy = if attr.mem_mgt_extensions {
            RegStrategy::FastRegistrationPool
        } else {
            RegStrategy::DirectDmaMap
        };
        log::info!(
            "Creating device {:#x}: {} CQ pairs, max_sge {}, {:?}",
            adapter,
            cq_count,
            attr.max_sge,
            strategy
        );

        let mut res = DeviceResources { verbs: Arc::clone(&verbs), pd: None, dma_mr: None, cqs: Vec::new() };
        let pd = verbs.alloc_pd(adapter)?;
        res.pd = Some(pd);

        let qps: Arc<QpTable> = Arc::new(RwLock::new(HashMap::new()));
        let mut cq_pairs = Vec::with_capacity(cq_count);
        let mut channels = Vec::with_capacity(cq_count);
        for index in 0..cq_count {
            let (tx, rx) = crossbeam::channel::unbounded();
            let notifier: CqNotifier = match config.completion_mode {
                CompletionMode::Event => {
                    let tx = tx.clone();
                    Arc::new(move |_cq| {
                        let _ = tx.send(WorkerMsg::Notify);
                    })
                }
                CompletionMode::Polled => Arc::new(|_cq| {}),
            };
            let depth = config.cq_depth.min(attr.max_cqe.max(1));
            let vector = index as u32 % attr.num_comp_vectors.max(1);

            let rx_cq = verbs.create_cq(adapter, depth, vector, Arc::clone(&notifier))?;
            res.cqs.push(rx_cq);
            let tx_cq = verbs.create_cq(adapter, depth, vector, notifier)?;
            res.cqs.push(tx_cq);
            verbs.req_notify_cq(rx_cq)?;
            verbs.req_notify_cq(tx_cq)?;

            cq_pairs.push(Arc::new(CqPair {
                index,
                rx_cq,
                tx_cq,
                verbs: Arc::clone(&verbs),
                qps: Arc::clone(&qps),
                drain_lock: Mutex::new(()),
            }));
            channels.push((tx, rx));
        }

        res.dma_mr = Some(verbs.get_dma_mr(pd, access::LOCAL_WRITE)?);

        let mut workers = Vec::new();
        if config.completion_mode == CompletionMode::Event {
            for (pair, (tx, rx)) in cq_pairs.iter().zip(channels) {
                // Workers spawned so far stop when `workers` drops
                workers.push(CqWorker::spawn(Arc::clone(pair), tx, rx)?);
            }
        }

        Ok(DeviceInner {
            registry: Arc::clone(registry),
            adapter,
            attr,
            strategy,
            cq_load: (0..cq_count).map(|_| AtomicUsize::new(0)).collect(),
            cq_pairs,
            qps,
            workers: Mutex::new(workers),
            resources: res,
        })
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        for worker in lock(&self.workers).iter_mut() {
            worker.stop();
        }
        let mut devices = lock(&self.registry.devices);
        if devices.get(&self.adapter).is_some_and(|w| w.strong_count() == 0) {
            devices.remove(&self.adapter);
        }
        log::info!("Released device {:#x}", self.adapter);
    }
}

impl Device {
    pub fn adapter(&self) -> AdapterId {
        self.inner.adapter
    }

    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.attr
    }

    /// Registration strategy chosen at creation
    pub fn strategy(&self) -> RegStrategy {
        self.inner.strategy
    }

    pub fn cq_count(&self) -> usize {
        self.inner.cq_pairs.len()
    }

    /// Queue pairs currently placed on a completion-queue pair
    pub fn cq_load(&self, index: usize) -> usize {
        self.inner.cq_load.get(index).map_or(0, |l| l.load(Ordering::Acquire))
    }

    /// Handles to this device, including the caller's
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Give up this handle
    ///
    /// When it is the last one, the device's workers stop, its adapter
    /// resources are destroyed and the registry entry goes away.
    pub fn release(self) {
        log::debug!("Releasing device {:#x}, refcount {}", self.inner.adapter, self.ref_count());
        drop(self);
    }

    /// Drain up to `budget` completions from one completion-queue pair
    ///
    /// Used with [`CompletionMode::Polled`]; in event mode the worker thread
    /// owns the queues.
    pub fn poll_completions(&self, index: usize, budget: usize) -> usize {
        self.inner.cq_pairs.get(index).map_or(0, |pair| pair.drain(budget))
    }

    pub(crate) fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.inner.resources.verbs
    }

    pub(crate) fn pd(&self) -> IsertResult<PdHandle> {
        self.inner
            .resources
            .pd
            .ok_or_else(|| IsertError::InvalidState("device has no protection domain".to_string()))
    }

    /// Local key of the global DMA region
    pub(crate) fn dma_lkey(&self) -> u32 {
        self.inner.resources.dma_mr.map_or(0, |mr| mr.lkey)
    }

    /// Scatter entries usable per send work request
    pub(crate) fn max_send_sge(&self) -> usize {
        (self.inner.attr.max_sge as usize).saturating_sub(2).max(1)
    }

    /// Pick the least loaded completion-queue pair and account for a new QP
    fn place_qp(&self) -> usize {
        let _registry = lock(&self.inner.registry.devices);
        let index = self
            .inner
            .cq_load
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| load.load(Ordering::Acquire))
            .map_or(0, |(i, _)| i);
        self.inner.cq_load[index].fetch_add(1, Ordering::AcqRel);
        index
    }

    fn unplace_qp(&self, index: usize) {
        let _registry = lock(&self.inner.registry.devices);
        if let Some(load) = self.inner.cq_load.get(index) {
            let _ = load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    pub(crate) fn attach_qp(&self, qp: QpNum, conn: Weak<ConnInner>) {
        self.inner.qps.write().unwrap_or_else(|e| e.into_inner()).insert(qp, conn);
    }

    fn detach_qp(&self, qp: QpNum) {
        self.inner.qps.write().unwrap_or_else(|e| e.into_inner()).remove(&qp);
    }
}

/// Queue pair placed on one of the device's completion-queue pairs
pub(crate) struct QueuePair {
    pub(crate) qp: QpNum,
    pub(crate) cq_index: usize,
    device: Device,
}

impl QueuePair {
    pub(crate) fn create(
        device: &Device,
        id: CmId,
        config: &TransportConfig,
    ) -> IsertResult<Self> {
        let cq_index = device.place_qp();
        let pair = &device.inner.cq_pairs[cq_index];
        let attr = QpInitAttr {
            send_cq: pair.tx_cq,
            recv_cq: pair.rx_cq,
            max_send_wr: config.send_queue_depth.min(device.attr().max_qp_wr),
            max_recv_wr: (config.recv_ring_size as u32 + 1).min(device.attr().max_qp_wr),
            max_send_sge: device.max_send_sge() as u32,
            max_recv_sge: 1,
            sq_sig_all: false,
        };
        let qp = match device.verbs().create_qp(id, device.pd()?, &attr) {
            Ok(qp) => qp,
            Err(e) => {
                device.unplace_qp(cq_index);
                return Err(e.into());
            }
        };
        log::debug!("Created QP {:?} on CQ pair {}", qp, cq_index);
        Ok(QueuePair { qp, cq_index, device: device.clone() })
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.device.detach_qp(self.qp);
        self.device.verbs().destroy_qp(self.qp);
        self.device.unplace_qp(self.cq_index);
    }
}

/// Single buffer mapped for device access; unmapped on drop
pub(crate) struct DmaMapping {
    verbs: Arc<dyn Verbs>,
    adapter: AdapterId,
    pub(crate) buf: HostBuffer,
    pub(crate) addr: u64,
    pub(crate) len: usize,
    pub(crate) dir: DmaDirection,
}

impl DmaMapping {
    pub(crate) fn map(device: &Device, buf: HostBuffer, dir: DmaDirection) -> IsertResult<Self> {
        let addr = device
            .verbs()
            .dma_map_single(device.adapter(), &buf, dir)
            .map_err(|e| IsertError::Mapping(e.to_string()))?;
        let len = buf.len();
        Ok(DmaMapping { verbs: Arc::clone(device.verbs()), adapter: device.adapter(), buf, addr, len, dir })
    }

    pub(crate) fn sync_for_cpu(&self) {
        self.verbs.sync_for_cpu(self.adapter, self.addr, self.len, self.dir);
    }

    pub(crate) fn sync_for_device(&self) {
        self.verbs.sync_for_device(self.adapter, self.addr, self.len, self.dir);
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        self.verbs.dma_unmap_single(self.adapter, self.addr, self.len, self.dir);
    }
}

/// Mapped scatter-gather list; unmapped on drop
pub(crate) struct SgMapping {
    verbs: Arc<dyn Verbs>,
    adapter: AdapterId,
    pub(crate) segments: Vec<DmaSegment>,
    dir: DmaDirection,
}

impl SgMapping {
    pub(crate) fn map(device: &Device, sg: &[HostBuffer], dir: DmaDirection) -> IsertResult<Self> {
        let segments = device
            .verbs()
            .dma_map_sg(device.adapter(), sg, dir)
            .map_err(|e| IsertError::Mapping(e.to_string()))?;
        if segments.is_empty() {
            return Err(IsertError::Mapping("scatter-gather list mapped to nothing".to_string()));
        }
        Ok(SgMapping { verbs: Arc::clone(device.verbs()), adapter: device.adapter(), segments, dir })
    }
}

impl Drop for SgMapping {
    fn drop(&mut self) {
        self.verbs.dma_unmap_sg(self.adapter, &self.segments, self.dir);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftRdma;

    const ADAPTER: AdapterId = 0x51;

    fn registry(attr: DeviceAttr) -> (Arc<SoftRdma>, DeviceRegistry) {
        let soft = Arc::new(SoftRdma::new());
        soft.add_adapter(ADAPTER, attr);
        let config = TransportConfig::default().with_completion_mode(CompletionMode::Polled);
        let registry = DeviceRegistry::new(soft.clone(), config);
        (soft, registry)
    }

    #[test]
    fn test_find_or_create_shares_device() {
        let (soft, registry) = registry(SoftRdma::direct_attr());
        let a = registry.find_or_create(ADAPTER).unwrap();
        let b = registry.find_or_create(ADAPTER).unwrap();
        assert_eq!(a.ref_count(), 2);
        assert_eq!(registry.device_count(), 1);
        assert_eq!(soft.stats().pds, 1);
        assert_eq!(a.strategy(), RegStrategy::DirectDmaMap);

        a.release();
        assert_eq!(b.ref_count(), 1);
        assert!(registry.get(ADAPTER).is_some());
    }

    #[test]
    fn test_last_release_destroys_device() {
        let (soft, registry) = registry(SoftRdma::fast_reg_attr());
        let device = registry.find_or_create(ADAPTER).unwrap();
        assert_eq!(device.strategy(), RegStrategy::FastRegistrationPool);
        assert_eq!(soft.stats().cqs, 2 * device.cq_count());

        device.release();
        assert_eq!(registry.device_count(), 0);
        assert!(registry.get(ADAPTER).is_none());
        let stats = soft.stats();
        assert_eq!((stats.pds, stats.cqs, stats.mrs), (0, 0, 0));

        // A later connection gets a fresh device
        let again = registry.find_or_create(ADAPTER).unwrap();
        assert_eq!(again.ref_count(), 1);
    }

    #[test]
    fn test_unknown_adapter_leaves_nothing_behind() {
        let (soft, registry) = registry(SoftRdma::direct_attr());
        assert!(registry.find_or_create(ADAPTER + 1).is_err());
        assert_eq!(registry.device_count(), 0);
        assert_eq!(soft.stats().pds, 0);
    }

    #[test]
    fn test_send_sge_leaves_room_for_headers() {
        let (_soft, registry) = registry(SoftRdma::direct_attr());
        let device = registry.find_or_create(ADAPTER).unwrap();
        assert_eq!(device.max_send_sge(), 2);
    }
}
