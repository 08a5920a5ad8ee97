//! Transport tunables

use crate::error::{IsertError, IsertResult};
use std::time::Duration;

/// How completion queues are drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum CompletionMode {
    /// One worker thread per completion-queue pair, woken by notifications
    #[default]
    Event,
    /// The caller drains queues through `Device::poll_completions`
    Polled,
}

/// Configuration for an iSER transport instance
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive descriptors per connection (power of two)
    pub recv_ring_size: usize,
    /// Receives posted at login and per replenish; replenish triggers once
    /// this many ring slots are free
    pub rx_low_water: usize,
    /// Every Kth coalescable send is signaled (1 signals every send)
    pub comp_batch_count: usize,
    /// Fast-registration descriptors per connection
    pub fastreg_pool_size: usize,
    /// Page-list capacity of one fast registration
    pub max_fastreg_pages: usize,
    /// Upper bound on completion-queue pairs per adapter
    pub max_cq: usize,
    pub cq_depth: u32,
    /// Send work requests per queue pair
    pub send_queue_depth: u32,
    /// Command contexts per connection
    pub max_commands: usize,
    /// Login request buffer length
    pub max_recv_data_segment_length: usize,
    /// Login response buffer length
    pub max_login_response_size: usize,
    pub page_size: usize,
    pub listen_backlog: u32,
    /// Accept wake-ups tolerated without a queued connection
    pub accept_retries: usize,
    pub accept_timeout: Duration,
    /// Wait for the next login request
    pub login_timeout: Duration,
    /// Upper bound on waiting for outstanding work to drain at teardown
    pub teardown_timeout: Duration,
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub completion_mode: CompletionMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_ring_size: 128,
            rx_low_water: 32,
            comp_batch_count: 8,
            fastreg_pool_size: 128,
            max_fastreg_pages: 256,
            max_cq: 64,
            cq_depth: 4096,
            send_queue_depth: 1024,
            max_commands: 1024,
            max_recv_data_segment_length: 8192,
            max_login_response_size: 8192,
            page_size: 4096,
            listen_backlog: 10,
            accept_retries: 5,
            accept_timeout: Duration::from_secs(1),
            login_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(5),
            initiator_depth: 16,
            responder_resources: 16,
            retry_count: 7,
            rnr_retry_count: 7,
            completion_mode: CompletionMode::Event,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recv_ring_size(mut self, n: usize) -> Self {
        self.recv_ring_size = n;
        self
    }

    pub fn with_rx_low_water(mut self, n: usize) -> Self {
        self.rx_low_water = n;
        self
    }

    pub fn with_comp_batch_count(mut self, n: usize) -> Self {
        self.comp_batch_count = n;
        self
    }

    pub fn with_fastreg_pool_size(mut self, n: usize) -> Self {
        self.fastreg_pool_size = n;
        self
    }

    pub fn with_max_fastreg_pages(mut self, n: usize) -> Self {
        self.max_fastreg_pages = n;
        self
    }

    pub fn with_max_cq(mut self, n: usize) -> Self {
        self.max_cq = n;
        self
    }

    pub fn with_max_recv_data_segment_length(mut self, n: usize) -> Self {
        self.max_recv_data_segment_length = n;
        self
    }

    pub fn with_max_login_response_size(mut self, n: usize) -> Self {
        self.max_login_response_size = n;
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub fn with_max_commands(mut self, n: usize) -> Self {
        self.max_commands = n;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self
    }

    /// Largest transfer one fast registration covers
    pub fn max_fastreg_bytes(&self) -> usize {
        self.max_fastreg_pages * self.page_size
    }

    /// Check the tunables against each other
    pub fn validate(&self) -> IsertResult<()> {
        if self.recv_ring_size == 0 || !self.recv_ring_size.is_power_of_two() {
            return Err(IsertError::Config(format!(
                "recv_ring_size must be a power of two, got {}",
                self.recv_ring_size
            )));
        }
        if self.rx_low_water == 0 || self.rx_low_water > self.recv_ring_size {
            return Err(IsertError::Config(format!(
                "rx_low_water must be in 1..={}, got {}",
                self.recv_ring_size, self.rx_low_water
            )));
        }
        if self.comp_batch_count == 0 {
            return Err(IsertError::Config("comp_batch_count must be at least 1".to_string()));
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(IsertError::Config(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.max_fastreg_pages == 0 || self.fastreg_pool_size == 0 {
            return Err(IsertError::Config(
                "fast registration pool and page list must be non-empty".to_string(),
            ));
        }
        if self.max_commands == 0 || self.send_queue_depth == 0 {
            return Err(IsertError::Config(
                "max_commands and send_queue_depth must be non-zero".to_string(),
            ));
        }
        if self.max_cq == 0 {
            return Err(IsertError::Config("max_cq must be at least 1".to_string()));
        }
        if self.max_recv_data_segment_length < crate::proto::ISER_HEADERS_LEN {
            return Err(IsertError::Config(format!(
                "max_recv_data_segment_length must hold the {} byte headers",
                crate::proto::ISER_HEADERS_LEN
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
