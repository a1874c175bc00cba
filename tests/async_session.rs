mod common;

use common::{config, ready, ready_with, tag, wait_for};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uhf_reader::frame;
use uhf_reader::{MemoryBank, ParamKey, ReaderError, SimpleReadPlan, StatusCode, TagOp, TagProtocol};

const EPC_A: [u8; 4] = [0xE2, 0x00, 0x00, 0x01];
const EPC_B: [u8; 4] = [0xE2, 0x00, 0x00, 0x02];

#[test]
fn test_every_report_delivered_once() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A));
    sim.add_tag(tag(&EPC_B));
    reader.set(ParamKey::AsyncOnTime, 20u32).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    reader.add_read_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    reader.start_reading().unwrap();
    assert!(reader.is_reading());
    assert!(wait_for(|| sim.cycles() >= 3));
    reader.stop_reading().unwrap();
    assert!(!reader.is_reading());

    let delivered = seen.load(Ordering::SeqCst) as u64;
    assert!(delivered >= 6);
    assert_eq!(delivered, sim.reported_tags());
}

#[test]
fn test_listeners_run_in_registration_order() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A));

    let calls = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let calls = Arc::clone(&calls);
        reader.add_read_listener(move |_| calls.lock().unwrap().push(name));
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| calls.lock().unwrap().len() >= 4));
    reader.stop_reading().unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len() % 2, 0);
    for pair in calls.chunks(2) {
        assert_eq!(pair, ["first", "second"]);
    }
}

#[test]
fn test_removed_listener_is_not_called() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A));

    let removed = Arc::new(AtomicUsize::new(0));
    let kept = Arc::new(AtomicUsize::new(0));
    let id = {
        let removed = Arc::clone(&removed);
        reader.add_read_listener(move |_| {
            removed.fetch_add(1, Ordering::SeqCst);
        })
    };
    {
        let kept = Arc::clone(&kept);
        reader.add_read_listener(move |_| {
            kept.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(reader.remove_listener(id));
    assert!(!reader.remove_listener(id));

    reader.start_reading().unwrap();
    assert!(wait_for(|| kept.load(Ordering::SeqCst) > 0));
    reader.stop_reading().unwrap();
    assert_eq!(removed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_only_one_session_at_a_time() {
    let (reader, _) = ready();

    reader.start_reading().unwrap();
    assert_eq!(reader.start_reading(), Err(ReaderError::SessionActive));
    assert_eq!(reader.read(100), Err(ReaderError::SessionActive));
    reader.stop_reading().unwrap();

    assert_eq!(reader.read(100), Ok(0));
}

#[test]
fn test_stop_without_session() {
    let (reader, _) = ready();
    assert_eq!(reader.stop_reading(), Err(ReaderError::NotReading));

    reader.start_reading().unwrap();
    reader.stop_reading().unwrap();
    assert_eq!(reader.stop_reading(), Err(ReaderError::NotReading));
}

#[test]
fn test_stop_from_listener() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A));
    let reader = Arc::new(reader);

    let outcome = Arc::new(Mutex::new(None));
    {
        let handle = Arc::downgrade(&reader);
        let outcome = Arc::clone(&outcome);
        let fired = AtomicBool::new(false);
        reader.add_read_listener(move |_| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(reader) = handle.upgrade() {
                *outcome.lock().unwrap() = Some(reader.stop_reading());
            }
        });
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| outcome.lock().unwrap().is_some()));
    assert_eq!(outcome.lock().unwrap().clone(), Some(Ok(())));
    assert!(wait_for(|| !reader.is_reading()));
    reader.start_reading().unwrap();
    reader.stop_reading().unwrap();
}

#[test]
fn test_stop_from_listener_delivers_every_tag() {
    let (reader, sim) = ready_with(config().with_event_capacity(1));
    for last in 0..8u8 {
        sim.add_tag(tag(&[0xE2, 0x00, 0x10, last]));
    }
    let reader = Arc::new(reader);

    let seen = Arc::new(AtomicUsize::new(0));
    {
        let handle = Arc::downgrade(&reader);
        let seen = Arc::clone(&seen);
        reader.add_read_listener(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                // Let the read loop fill the queue behind us
                std::thread::sleep(Duration::from_millis(50));
                if let Some(reader) = handle.upgrade() {
                    reader.stop_reading().unwrap();
                }
            }
        });
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| seen.load(Ordering::SeqCst) > 0 && !reader.is_reading()));
    assert_eq!(seen.load(Ordering::SeqCst) as u64, sim.reported_tags());
}

#[test]
fn test_stop_timeout_keeps_session() {
    let (reader, sim) = ready_with(config().with_stop_grace(Duration::from_millis(150)));
    sim.add_tag(tag(&EPC_A));

    let running = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let slow = Arc::new(AtomicBool::new(true));
    let entered = Arc::new(AtomicBool::new(false));
    {
        let (running, most, slow, entered) =
            (Arc::clone(&running), Arc::clone(&most), Arc::clone(&slow), Arc::clone(&entered));
        reader.add_read_listener(move |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            most.fetch_max(now, Ordering::SeqCst);
            entered.store(true, Ordering::SeqCst);
            if slow.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(400));
            }
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| entered.load(Ordering::SeqCst)));
    assert_eq!(reader.stop_reading(), Err(ReaderError::Timeout(150)));

    assert!(reader.is_reading());
    assert_eq!(reader.start_reading(), Err(ReaderError::SessionActive));
    assert_eq!(reader.read(100), Err(ReaderError::SessionActive));

    assert!(wait_for(|| reader.stop_reading().is_ok() || !reader.is_reading()));
    assert!(!reader.is_reading());

    reader.start_reading().unwrap();
    assert!(wait_for(|| sim.cycles() > 2));
    reader.stop_reading().unwrap();
    assert_eq!(most.load(Ordering::SeqCst), 1);
}

#[test]
fn test_calls_from_listener_reach_reader() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A));
    let reader = Arc::new(reader);

    let power = Arc::new(Mutex::new(None));
    {
        let handle = Arc::downgrade(&reader);
        let power = Arc::clone(&power);
        reader.add_read_listener(move |_| {
            if let Some(reader) = handle.upgrade() {
                *power.lock().unwrap() = Some(reader.get::<i32>(ParamKey::ReadPower));
            }
        });
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| power.lock().unwrap().is_some()));
    reader.stop_reading().unwrap();
    assert_eq!(power.lock().unwrap().clone(), Some(Ok(3000)));
}

#[test]
fn test_cycle_errors_reach_exception_listener() {
    let (reader, sim) = ready();
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        reader.add_exception_listener(move |e| errors.lock().unwrap().push(e.clone()));
    }

    sim.fail_next(frame::READ_CYCLE, StatusCode::OutOfMemory);
    reader.start_reading().unwrap();
    assert!(wait_for(|| !errors.lock().unwrap().is_empty()));
    // The loop keeps going after a failed cycle
    let cycles = sim.cycles();
    assert!(wait_for(|| sim.cycles() > cycles));
    reader.stop_reading().unwrap();

    assert_eq!(errors.lock().unwrap()[0], ReaderError::OutOfMemory);
}

#[test]
fn test_auth_listener_answers_requests() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A).with_access_password(0x1234_5678).with_user(&[0xCA, 0xFE]));
    sim.add_tag(tag(&EPC_B).with_access_password(0x0000_0042).with_user(&[0xBE, 0xEF]));

    let plan = SimpleReadPlan::new(&[1], TagProtocol::Gen2, 1000)
        .unwrap()
        .with_tag_op(TagOp::Gen2SecureReadData {
            bank: MemoryBank::User,
            word_address: 0,
            word_count: 1,
            access_password: None,
        });
    reader.commit_plan(&plan.into()).unwrap();

    // Only the first tag's password is known
    reader.set_auth_listener(|tag| (tag.tag.epc == EPC_A).then_some(0x1234_5678));

    let reads = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let reads = Arc::clone(&reads);
        reader.add_read_listener(move |t| reads.lock().unwrap().push((t.tag.epc.clone(), t.data.clone())));
        let errors = Arc::clone(&errors);
        reader.add_exception_listener(move |e| errors.lock().unwrap().push(e.clone()));
    }

    reader.start_reading().unwrap();
    assert!(wait_for(|| reads.lock().unwrap().len() >= 2));
    reader.stop_reading().unwrap();

    let reads = reads.lock().unwrap();
    assert_eq!(reads[0], (EPC_A.to_vec(), vec![0xCA, 0xFE]));
    assert_eq!(reads[1], (EPC_B.to_vec(), vec![]));
    assert!(errors.lock().unwrap().contains(&ReaderError::AccessDenied));
}

#[test]
fn test_tag_ops_while_reading() {
    let (reader, sim) = ready();
    sim.add_tag(tag(&EPC_A).with_user(&[0x00, 0x00, 0x00, 0x00]));
    reader.set(ParamKey::AsyncOnTime, 20u32).unwrap();
    reader.start_reading().unwrap();

    let write = TagOp::Gen2WriteData {
        bank: MemoryBank::User,
        word_address: 1,
        data: vec![0xA5A5],
    };
    for _ in 0..5 {
        assert_eq!(reader.execute_tag_op(&write, None), Ok(vec![]));
        assert_eq!(reader.get::<u32>(ParamKey::AsyncOnTime), Ok(20));
    }
    reader.stop_reading().unwrap();

    assert_eq!(sim.tag(&EPC_A).unwrap().user(), &[0x00, 0x00, 0xA5, 0xA5]);
}

#[test]
fn test_shutdown_stops_session() {
    let (reader, sim) = ready();
    reader.start_reading().unwrap();
    assert!(wait_for(|| sim.cycles() > 0));
    reader.shutdown().unwrap();

    let cycles = sim.cycles();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.cycles(), cycles);
}

#[test]
fn test_drop_stops_session() {
    let (reader, sim) = ready();
    reader.start_reading().unwrap();
    assert!(wait_for(|| sim.cycles() > 0));
    drop(reader);

    let cycles = sim.cycles();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.cycles(), cycles);
}

#[test]
fn test_readers_are_independent() {
    let (first, first_sim) = ready();
    let (second, second_sim) = ready();
    first_sim.add_tag(tag(&EPC_A));
    second_sim.add_tag(tag(&EPC_B));

    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&first_seen);
        first.add_read_listener(move |t| seen.lock().unwrap().push(t.tag.epc.clone()));
        let seen = Arc::clone(&second_seen);
        second.add_read_listener(move |t| seen.lock().unwrap().push(t.tag.epc.clone()));
    }

    first.start_reading().unwrap();
    second.start_reading().unwrap();
    assert!(wait_for(|| !first_seen.lock().unwrap().is_empty() && !second_seen.lock().unwrap().is_empty()));
    first.stop_reading().unwrap();
    second.stop_reading().unwrap();

    assert!(first_seen.lock().unwrap().iter().all(|epc| epc[..] == EPC_A));
    assert!(second_seen.lock().unwrap().iter().all(|epc| epc[..] == EPC_B));
}
