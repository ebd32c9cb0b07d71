//! Service and connection identifier layout.
//!
//! Grounded on `examples/original_source/core/core/worker.h`'s
//! `make_serviceid` (`MAX_SERVICE_NUM = 0xFFFF`, biased so `0` is never a
//! valid id, worker id packed into the top byte) and
//! `examples/original_source/core/components/tcp/impl/tcp.cpp`'s
//! `make_connid` (16-bit monotonic counter, wraps `0xFFFF -> 1`, skipping
//! ids currently in use).

/// Upper bound on live services per worker before the low 24 bits wrap.
pub const MAX_SERVICE_NUM: u32 = 1 << 16;

/// Build a service id from a worker id and a per-worker monotonic counter.
/// The counter is taken modulo [`MAX_SERVICE_NUM`] and biased by one so that
/// `0` (reserved for "no service" / broadcast) never appears as a real id.
pub fn make_service_id(worker_id: u8, counter: u32) -> u32 {
    let low = (counter % MAX_SERVICE_NUM) + 1;
    ((worker_id as u32) << 24) | low
}

/// Extract the worker id (top byte) from a service id.
pub fn worker_of(service_id: u32) -> u8 {
    (service_id >> 24) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_worker_id_into_top_byte() {
        let id = make_service_id(3, 0);
        assert_eq!(worker_of(id), 3);
        assert_eq!(id & 0x00FF_FFFF, 1);
    }

    #[test]
    fn counter_wraps_within_low_bits_and_skips_zero() {
        let id = make_service_id(0, MAX_SERVICE_NUM);
        assert_eq!(id & 0x00FF_FFFF, 1);
        assert_ne!(id, 0);
    }
}
