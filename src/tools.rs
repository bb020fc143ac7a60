//! Typed collective helpers built on the communicator primitives.

use bytemuck::Pod;

use crate::comm::Communicator;

/// Gather one fixed-size value per rank to all ranks.
pub fn all_gather_pod<T: Pod, C: Communicator>(comm: &C, value: &T) -> Vec<T> {
    comm.all_gather_bytes(bytemuck::bytes_of(value))
        .iter()
        .map(|bytes| bytemuck::pod_read_unaligned(bytes.as_slice()))
        .collect()
}

/// Gather a variable-length slice per rank to all ranks.
pub fn all_gather_varcount_pod<T: Pod, C: Communicator>(comm: &C, values: &[T]) -> Vec<Vec<T>> {
    comm.all_gather_bytes(bytemuck::cast_slice(values))
        .iter()
        .map(|bytes| bytemuck::pod_collect_to_vec::<u8, T>(bytes.as_slice()))
        .collect()
}

/// Logical OR across all ranks.
pub fn all_reduce_or<C: Communicator>(comm: &C, value: bool) -> bool {
    if comm.size() == 1 {
        return value;
    }
    all_gather_pod(comm, &(value as u8)).iter().any(|&v| v != 0)
}

/// Logical AND across all ranks.
pub fn all_reduce_and<C: Communicator>(comm: &C, value: bool) -> bool {
    if comm.size() == 1 {
        return value;
    }
    all_gather_pod(comm, &(value as u8)).iter().all(|&v| v != 0)
}

/// Sum across all ranks.
pub fn all_reduce_sum_u64<C: Communicator>(comm: &C, value: u64) -> u64 {
    if comm.size() == 1 {
        return value;
    }
    all_gather_pod(comm, &value).iter().sum()
}

/// Maximum across all ranks.
pub fn all_reduce_max_u8<C: Communicator>(comm: &C, value: u8) -> u8 {
    if comm.size() == 1 {
        return value;
    }
    all_gather_pod(comm, &value).iter().copied().max().unwrap_or(value)
}

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`; the last
/// count only contributes to the total.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::SerialComm;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_serial_reductions() {
        let comm = SerialComm;
        assert!(all_reduce_or(&comm, true));
        assert!(!all_reduce_or(&comm, false));
        assert!(all_reduce_and(&comm, true));
        assert_eq!(all_reduce_sum_u64(&comm, 7), 7);
        assert_eq!(all_reduce_max_u8(&comm, 3), 3);
        assert_eq!(all_gather_pod(&comm, &42u64), vec![42]);
        let values = [1.0f64, 2.0];
        assert_eq!(
            all_gather_varcount_pod(&comm, &values[..]),
            vec![vec![1.0, 2.0]]
        );
    }
}
