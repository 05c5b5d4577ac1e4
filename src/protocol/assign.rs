use crate::{
    error::{Error, Result},
    mesh::Rank,
};

/// Static round-robin: point `i` goes to worker rank `(i mod W) + 1`.
pub fn assign(point_index: usize, worker_count: usize) -> Result<Rank> {
    if worker_count == 0 {
        Err(Error::Config("cannot assign points without workers".into()))?
    }
    Ok(point_index % worker_count + 1)
}

/// How many points each worker receives for `points` points, indexed by
/// rank (index 0, the coordinator, is always zero).
pub fn workload(points: usize, worker_count: usize) -> Result<Vec<usize>> {
    let mut load = vec![0; worker_count + 1];
    for index in 0..points {
        load[assign(index, worker_count)?] += 1;
    }
    Ok(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_points_over_three_workers() {
        let ranks: Vec<Rank> =
            (0..10).map(|i| assign(i, 3).unwrap()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn single_worker_takes_everything() {
        assert!((0..7).all(|i| assign(i, 1).unwrap() == 1));
    }

    #[test]
    fn no_workers_is_a_config_error() {
        assert!(matches!(assign(0, 0), Err(Error::Config(_))));
    }

    #[test]
    fn workload_counts() {
        assert_eq!(workload(10, 3).unwrap(), vec![0, 4, 3, 3]);
        assert_eq!(workload(0, 2).unwrap(), vec![0, 0, 0]);
    }
}
