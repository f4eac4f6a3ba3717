// tests/test_scheduler.rs — Partition-plan properties and the
// simulated-device scenarios.
//
// The scheduler is pure, so multi-GPU behavior is tested here with
// fabricated memory capacities — no hardware involved. The capacities
// give each simulated device one byte of headroom above the intended
// chunk size: the halving rule splits while `chunk >= memory`, and the
// scenarios describe devices that hold their chunk, not ones exactly
// at the boundary.

use konrad::geometry::{calculate_volume_geometry, DetectorGeometry};
use konrad::scheduler::{DeviceMemory, PlanError, ReconstructionPlan};

fn scenario_detector() -> DetectorGeometry {
    DetectorGeometry {
        n_row: 32,
        n_col: 32,
        l_px_row: 1.0,
        l_px_col: 1.0,
        delta_s: 0.0,
        delta_t: 0.0,
        d_so: 100.0,
        d_od: 100.0,
        n_proj: 1,
        rot_angle: 1.0,
    }
}

fn plan_with_capacities(capacities: &[usize]) -> ReconstructionPlan {
    let devices: Vec<DeviceMemory> = capacities
        .iter()
        .enumerate()
        .map(|(id, &bytes)| DeviceMemory { id, bytes })
        .collect();
    ReconstructionPlan::new(&scenario_detector(), &devices).expect("plan should succeed")
}

// ===== Partition completeness (property 2) =====

#[test]
fn subvolumes_cover_volume_exactly() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);

    for capacities in [
        vec![1usize << 30],
        vec![vol.bytes() / 2 + 1],
        vec![vol.bytes() / 8 + 1],
        vec![vol.bytes() / 4 + 1, vol.bytes() / 4 + 1],
        vec![1 << 30, 1 << 30, vol.bytes() / 4 + 1],
    ] {
        let plan = plan_with_capacities(&capacities);

        let total: u32 = plan.subvolumes.iter().map(|s| s.dim_z_local).sum();
        assert_eq!(total, plan.volume.dim_z, "capacities {capacities:?}");

        // Non-overlapping and covering [0, dim_z): sorted by offset,
        // each slab starts where the previous one ended.
        let mut slabs = plan.subvolumes.clone();
        slabs.sort_by_key(|s| s.z_offset);
        let mut next = 0u32;
        for s in &slabs {
            assert_eq!(s.z_offset, next, "gap or overlap at slab #{}", s.index);
            assert!(s.dim_z_local > 0, "empty slab #{}", s.index);
            next += s.dim_z_local;
        }
        assert_eq!(next, plan.volume.dim_z);
    }
}

#[test]
fn chunk_counts_are_powers_of_two() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    // 1/7th of the volume per device: the per-device half starts at
    // bytes/2 and must halve twice to fit.
    let plan = plan_with_capacities(&[vol.bytes() / 7 + 1, vol.bytes() / 7 + 1]);
    assert_eq!(plan.chunks_per_device, vec![4, 4]);
    for (d, count) in plan.chunks_per_device.iter().enumerate() {
        assert!(count.is_power_of_two(), "device {d}: {count} chunks");
    }
}

// ===== Sub-projection row bounds (property 3) =====

#[test]
fn subprojection_rows_within_detector() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);

    for capacities in [
        vec![1usize << 30],
        vec![vol.bytes() / 4 + 1],
        vec![vol.bytes() / 16 + 1],
        vec![vol.bytes() / 2 + 1, vol.bytes() / 2 + 1],
    ] {
        let plan = plan_with_capacities(&capacities);
        for s in &plan.subvolumes {
            assert!(
                s.row_top <= s.row_bottom,
                "slab #{}: rows [{}, {}]",
                s.index,
                s.row_top,
                s.row_bottom
            );
            assert!(
                s.row_bottom <= det.n_col - 1,
                "slab #{}: row_bottom {} exceeds detector",
                s.index,
                s.row_bottom
            );
        }
    }
}

#[test]
fn subprojection_rows_with_vertical_offset() {
    // A vertical principal-point offset must not push any band outside
    // the physical detector.
    let mut det = scenario_detector();
    det.delta_t = 3.5;
    // Four roomy devices: the banding is exercised by the slab count,
    // not by memory pressure (the offset makes dim_z awkward).
    let devices: Vec<DeviceMemory> = (0..4)
        .map(|id| DeviceMemory {
            id,
            bytes: 1 << 30,
        })
        .collect();
    let plan = ReconstructionPlan::new(&det, &devices).unwrap();
    for s in &plan.subvolumes {
        assert!(s.row_top <= s.row_bottom);
        assert!(s.row_bottom < det.n_col);
    }
}

#[test]
fn lower_slabs_use_lower_detector_rows() {
    // Detector row 0 is the top edge (most negative t): the slab at
    // the bottom of the volume (z_offset 0, most negative z) projects
    // onto the *lower-index* rows of the detector band.
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    let plan = plan_with_capacities(&[vol.bytes() / 4 + 1]);
    let mut slabs = plan.subvolumes.clone();
    slabs.sort_by_key(|s| s.z_offset);
    for pair in slabs.windows(2) {
        assert!(
            pair[0].row_top <= pair[1].row_top,
            "row bands should track slab height: {:?} vs {:?}",
            pair[0],
            pair[1]
        );
        assert!(pair[0].row_bottom <= pair[1].row_bottom);
    }
}

// ===== Scenario S4: two devices, clean split =====

#[test]
fn s4_two_devices_split_in_half() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    // Each device holds one half-volume chunk (plus the one byte of
    // headroom the >= halving rule requires).
    let half = vol.bytes() / 2 + 1;
    let plan = plan_with_capacities(&[half, half]);

    assert_eq!(plan.chunks_per_device, vec![1, 1]);
    assert_eq!(plan.subvolumes.len(), 2);

    let z_step = vol.dim_z / 2;
    assert_eq!(plan.subvolumes[0].device, 0);
    assert_eq!(plan.subvolumes[0].z_offset, 0);
    assert_eq!(plan.subvolumes[0].dim_z_local, z_step);
    assert_eq!(plan.subvolumes[1].device, 1);
    assert_eq!(plan.subvolumes[1].z_offset, z_step);
    assert_eq!(plan.subvolumes[1].dim_z_local, vol.dim_z - z_step);
}

// ===== Scenario S5: single device, halved twice =====

#[test]
fn s5_single_device_halves_to_four() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    // A quarter-volume chunk fits, a half-volume chunk does not.
    let quarter = vol.bytes() / 4 + 1;
    let plan = plan_with_capacities(&[quarter]);

    assert_eq!(plan.chunks_per_device, vec![4]);
    assert_eq!(plan.subvolumes.len(), 4);

    // Four contiguous z-bands on device 0.
    let z_step = vol.dim_z / 4;
    for (n, s) in plan.subvolumes.iter().enumerate() {
        assert_eq!(s.device, 0);
        assert_eq!(s.z_offset, n as u32 * z_step);
    }
    let total: u32 = plan.subvolumes.iter().map(|s| s.dim_z_local).sum();
    assert_eq!(total, vol.dim_z);
}

// ===== Rejection =====

#[test]
fn plan_rejected_when_nothing_fits() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    // Far less than a single z-slice: no amount of halving helps.
    let sliver = vol.dim_x as usize * 4 / 2;
    let devices = [DeviceMemory {
        id: 0,
        bytes: sliver,
    }];
    match ReconstructionPlan::new(&det, &devices) {
        Err(PlanError::ChunkTooLarge { needed, available }) => {
            assert!(needed > available);
        }
        other => panic!("expected ChunkTooLarge, got {other:?}"),
    }
}
