//! Observability and Metrics
//!
//! Counters for connection, handshake, framing and dispatch activity.
//!
//! Uses atomic counters for thread-safe metrics collection. One instance is
//! shared by every connection of a server through its context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for connection operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Connections refused at the connection limit
    pub connections_rejected: AtomicU64,
    /// Successful logins
    pub handshakes_success: AtomicU64,
    /// Handshakes that closed the connection
    pub handshakes_failed: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total bytes sent (frame headers included)
    pub bytes_sent: AtomicU64,
    /// Total bytes received (frame headers included)
    pub bytes_received: AtomicU64,
    /// Frames whose payload could not be decoded
    pub decode_errors: AtomicU64,
    /// Messages rejected by the dispatcher
    pub dispatch_errors: AtomicU64,
    /// Outgoing payloads sent compressed
    pub compressed_frames: AtomicU64,
    /// Writes that hit a full outgoing buffer
    pub write_stalls: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
            compressed_frames: AtomicU64::new(0),
            write_stalls: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        // never wraps below zero even if close is reported twice
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a connection refused at the limit
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful login
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an undecodable frame
    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message rejected by the dispatcher
    pub fn dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compressed outgoing payload
    pub fn frame_compressed(&self) {
        self.compressed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write parked because the outgoing buffer was full
    pub fn write_stalled(&self) {
        self.write_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            compressed_frames: self.compressed_frames.load(Ordering::Relaxed),
            write_stalls: self.write_stalls.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            decode_errors = snapshot.decode_errors,
            dispatch_errors = snapshot.dispatch_errors,
            compressed_frames = snapshot.compressed_frames,
            write_stalls = snapshot.write_stalls,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub dispatch_errors: u64,
    pub compressed_frames: u64,
    pub write_stalls: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.connection_closed();
        metrics.connection_closed();
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 0);
    }

    #[test]
    fn test_frame_counters() {
        let metrics = Metrics::new();
        metrics.frame_received(10);
        metrics.frame_sent(20);
        metrics.frame_sent(5);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 25);
    }
}
