mod common;

use std::time::Duration;

use hexapod_runtime::hexapod::{Gait, GaitSequencer, StrideTuning};

const DWELL: Duration = Duration::from_millis(20);

#[test]
fn test_rotate_in_place_respects_dwell() {
    let (mut body, sim) = common::body();
    let gait = Gait::rotate_in_place(20, 20);
    let report = GaitSequencer::new(DWELL).run(&mut body, &gait).unwrap();
    assert_eq!(report.phases_run, 6);
    assert!(!report.cancelled);

    let frames = sim.frames();
    let sizes: Vec<usize> = gait.phases.iter().map(common::frames_in).collect();
    assert_eq!(sizes, [6, 3, 6, 6, 3, 6]);
    assert_eq!(frames.len(), sizes.iter().sum::<usize>());

    // Every frame of phase N+1 comes at least one dwell after the last frame of phase N
    let mut start = 0;
    for pair in sizes.windows(2) {
        let last_of_phase = frames[start + pair[0] - 1].0;
        let next_phase = &frames[start + pair[0]..start + pair[0] + pair[1]];
        for (at, _) in next_phase {
            assert!(at.duration_since(last_of_phase) >= DWELL);
        }
        start += pair[0];
    }
    assert!(frames.iter().all(|(_, f)| f.command == 1));
}

#[test]
fn test_rotate_in_place_ends_where_it_started() {
    let (mut body, sim) = common::body();
    let before = body.angles();
    GaitSequencer::new(Duration::from_millis(1))
        .run(&mut body, &Gait::rotate_in_place(30, 25))
        .unwrap();
    assert_eq!(body.angles(), before);
    for id in 1..=18u8 {
        let expected = [500, 400, 600][(id as usize - 1) % 3];
        assert_eq!(sim.servo(id).unwrap().position, expected);
    }
}

#[test]
fn test_walk_ends_with_stand_phase() {
    let (mut body, sim) = common::body();
    let gait = Gait::move_forward(&StrideTuning::default());
    GaitSequencer::new(Duration::from_millis(1))
        .run(&mut body, &gait)
        .unwrap();
    let sizes: Vec<usize> = gait.phases.iter().map(common::frames_in).collect();
    assert_eq!(sizes, [6, 3, 6, 9, 3, 6, 3, 18]);
    assert_eq!(sim.frames().len(), sizes.iter().sum::<usize>());
}

#[test]
fn test_walk_cycles_return_to_stance() {
    let (mut body, _sim) = common::body();
    body.change_height(15).unwrap();
    let stance = body.angles();
    let tuning = StrideTuning {
        stretch: 10,
        ..StrideTuning::default()
    };
    let sequencer = GaitSequencer::new(Duration::from_millis(1));
    sequencer
        .run_cycles(&mut body, &Gait::move_forward(&tuning), 3)
        .unwrap();
    assert_eq!(body.angles(), stance);
    sequencer
        .run(&mut body, &Gait::move_backward(&tuning))
        .unwrap();
    assert_eq!(body.angles(), stance);
    assert_eq!(body.default_angles(), stance);
}
