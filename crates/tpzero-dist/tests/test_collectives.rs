//! Integration tests for ring collectives across local worker threads

use tpzero_dist::{Collective, CommError, LocalCluster, ParallelLayout};

#[test]
fn test_ring_all_reduce_sums_across_world() {
    let layout = ParallelLayout::new(4, 1).unwrap();
    let results = LocalCluster::launch(layout, |state| {
        // Rank r contributes (r + 1) in every slot; 1 + 2 + 3 + 4 = 10.
        let mut buf = vec![(state.global_rank() + 1) as f32; 7];
        state.dp_group().all_reduce_sum(&mut buf)?;
        Ok::<_, CommError>(buf)
    })
    .expect("launch failed");

    for buf in results {
        assert_eq!(buf.len(), 7);
        for value in buf {
            assert!((value - 10.0).abs() < 1e-6);
        }
    }
}

#[test]
fn test_all_reduce_handles_buffers_shorter_than_group() {
    let layout = ParallelLayout::new(4, 1).unwrap();
    let results = LocalCluster::launch(layout, |state| {
        let mut buf = [state.global_rank() as f64, 1.0];
        state.dp_group().all_reduce_sum_f64(&mut buf)?;
        Ok::<_, CommError>(buf)
    })
    .unwrap();

    for buf in results {
        assert_eq!(buf, [6.0, 4.0]);
    }
}

#[test]
fn test_groups_are_independent() {
    let layout = ParallelLayout::new(4, 2).unwrap();
    let results = LocalCluster::launch(layout, |state| {
        let mut tp = [state.global_rank() as f32];
        state.tp_group().all_reduce_sum(&mut tp)?;
        let mut dp = [state.global_rank() as f32];
        state.dp_group().all_reduce_sum(&mut dp)?;
        Ok::<_, CommError>((tp[0], dp[0]))
    })
    .unwrap();

    // tp groups [0,1] [2,3]; dp groups [0,2] [1,3]
    assert_eq!(results, vec![(1.0, 2.0), (1.0, 4.0), (5.0, 2.0), (5.0, 4.0)]);
}

#[test]
fn test_all_gather_orders_by_rank() {
    let layout = ParallelLayout::new(3, 1).unwrap();
    let results = LocalCluster::launch(layout, |state| {
        let rank = state.global_rank() as f32;
        state.dp_group().all_gather(&[rank, rank * 10.0])
    })
    .unwrap();

    for gathered in results {
        assert_eq!(gathered, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]);
    }
}

#[test]
fn test_failed_rank_unblocks_peers() {
    let layout = ParallelLayout::new(2, 1).unwrap();
    let result = LocalCluster::launch(layout, |state| {
        if state.global_rank() == 1 {
            return Err(CommError::InvalidTopology("rank 1 gave up".into()));
        }
        state.dp_group().barrier()?;
        Ok(())
    });

    assert!(result.is_err());
}

#[test]
fn test_state_ranks_follow_layout() {
    let layout = ParallelLayout::new(8, 2).unwrap();
    let states = LocalCluster::build(layout);
    assert_eq!(states.len(), 8);
    let state = &states[5];
    assert_eq!(state.tp_rank(), 1);
    assert_eq!(state.dp_rank(), 2);
    assert_eq!(state.dp_size(), 4);
    assert_eq!(state.tp_group().members(), &[4, 5]);
    assert_eq!(state.dp_group().members(), &[1, 3, 5, 7]);
    assert!(states[0].is_root());
    assert!(!state.is_root());
}

#[test]
fn test_rendezvous_spans_all_groups() {
    let layout = ParallelLayout::new(6, 3).unwrap();
    let ranks = LocalCluster::launch(layout, |state| {
        state.rendezvous()?;
        Ok::<_, CommError>(state.global_rank())
    })
    .unwrap();
    assert_eq!(ranks, vec![0, 1, 2, 3, 4, 5]);
}
