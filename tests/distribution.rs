// Property tests for the whole-to-parts planner.
// Run with: cargo test --test distribution -- --nocapture

use dmxp_transport::DataTransport::distribution::{
    DataDistribution, DataPartition, DistributionType, TransferPlan,
};

fn block(size: usize) -> DataDistribution {
    DataDistribution::new(DistributionType::Parallel, DataPartition::block(size))
}

#[test]
fn test_pieces_tile_the_whole() {
    let mut rng = fastrand::Rng::with_seed(0x444d_5850);
    for _ in 0..500 {
        let block_size = rng.usize(1..=512);
        let length = rng.usize(1..=8192);
        let ports = rng.usize(1..=8);
        let plan = TransferPlan::new(&DataDistribution::parallel(), &block(block_size), length, length, ports)
            .unwrap();

        let mut covered = 0;
        for (i, piece) in plan.pieces().iter().enumerate() {
            assert_eq!(piece.index, i);
            assert_eq!(piece.src_offset, covered, "pieces must be contiguous");
            assert_eq!(piece.dst_offset, piece.src_offset);
            assert!(piece.length > 0 && piece.length <= block_size);
            assert_eq!(piece.rank, i % ports);
            assert_eq!(piece.sequence, i / ports);
            covered += piece.length;
        }
        assert_eq!(covered, length);
        assert_eq!(plan.transfer_count(), length.div_ceil(block_size));

        let last_count = (0..plan.transfer_count())
            .filter(|&i| plan.is_last_for_rank(i))
            .count();
        assert_eq!(last_count, ports.min(plan.transfer_count()));
    }
}

#[test]
fn test_example_256_into_64_byte_blocks() {
    let plan = TransferPlan::new(&DataDistribution::parallel(), &block(64), 256, 256, 1).unwrap();
    assert_eq!(plan.transfer_count(), 4);
    assert_eq!(plan.parts_per_whole(), 4);
    for (i, expected) in [0, 64, 128, 192].into_iter().enumerate() {
        assert_eq!(plan.calculate_buffer_offsets(i).unwrap(), (expected, expected, 64));
    }
    assert!(plan.calculate_buffer_offsets(4).is_err());
}

#[test]
fn test_indivisible_moves_one_whole() {
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..100 {
        let length = rng.usize(1..=65536);
        let ports = rng.usize(1..=16);
        let d = DataDistribution::parallel();
        let plan = TransferPlan::new(&d, &d, length, length + rng.usize(0..64), ports).unwrap();
        assert_eq!(plan.transfer_count(), 1);
        assert_eq!(plan.calculate_buffer_offsets(0).unwrap(), (0, 0, length));
    }
}
