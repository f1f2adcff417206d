use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// `IP_FLOWID`, not always present in `libc`'s header bindings on every
/// target, so it's defined here directly rather than pulled in conditionally.
pub const IP_FLOWID: libc::c_int = 25;

/// Read the kernel-assigned flow id off an accepted socket.
pub fn get_flowid(fd: RawFd) -> io::Result<u32> {
    let mut flowid: u32 = 0;
    let mut len = size_of::<u32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IP,
            IP_FLOWID,
            std::ptr::addr_of_mut!(flowid).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flowid)
}

/// Map a flow id to a worker bucket index, or `None` when the connection
/// carries no flow id and should stay on the accepting thread.
///
/// A zero flow id means "no information available," kept local rather than
/// steered; otherwise the flow id selects a bucket by the low bits modulo the
/// worker count, so it works for any `n_workers`, not just powers of two.
pub fn flowid_to_bucket(flowid: u32, n_workers: usize) -> Option<usize> {
    if flowid == 0 || n_workers == 0 {
        return None;
    }
    Some(flowid as usize % n_workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flowid_stays_local() {
        assert_eq!(flowid_to_bucket(0, 8), None);
    }

    #[test]
    fn nonzero_flowid_maps_modulo_worker_count() {
        assert_eq!(flowid_to_bucket(0x1234, 8), Some(0x1234 % 8));
    }

    #[test]
    fn non_power_of_two_worker_count_still_maps_correctly() {
        // A bitmask can only select a bucket when `n_workers` is a power of
        // two; modulo works for any count, which this exercises with 3.
        assert_eq!(flowid_to_bucket(10, 3), Some(10 % 3));
        assert_eq!(flowid_to_bucket(11, 3), Some(11 % 3));
        assert_eq!(flowid_to_bucket(12, 3), Some(12 % 3));
    }

    #[test]
    fn zero_worker_count_stays_local() {
        assert_eq!(flowid_to_bucket(5, 0), None);
    }
}
