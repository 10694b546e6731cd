//! Periodically transmit payloads from a node, perturbed by a persisted schedule offset.
//!
//! # Overview
//!
//! The [Sender] is either stopped or running. [Sender::start] schedules the first send cycle
//! `initial_delay` from now (cancelling any pending cycle) and [Sender::stop] cancels the
//! pending cycle. A running sender holds exactly one pending cycle on the [crate::Clock].
//!
//! # Send Cycle
//!
//! Each cycle, in order:
//! 1. Builds a payload of `packet_size` bytes plus whatever the [crate::size::SizeChooser] draws.
//! 2. Hands the payload to the node's [crate::Transmitter] and notifies subscribers.
//! 3. Reads the node's schedule offset from the [crate::offset::Store] (a missing record is
//!    initialized to [crate::offset::ZERO] and read as zero).
//! 4. If the text read is not exactly [crate::offset::ZERO], resets the record to [crate::offset::ZERO].
//! 5. Parses the text read in step 3 as seconds.
//! 6. Schedules the next cycle `offset + interval` from now.
//!
//! An offset therefore delays only the next cycle, unless something outside the sender writes
//! a new offset before the next cycle reads it.
//!
//! # Failures
//!
//! A node without a transmitter cannot be started ([crate::Error::TransmitterMissing]). A cycle
//! that cannot read, reset, or parse its offset has no caller to report to: it stops the sender,
//! logs the error and panics, halting the simulation.

mod config;
pub use config::Config;
mod metrics;
mod sender;
pub use sender::{Notification, Sender};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deterministic::{Context, Executor, Runner},
        mocks,
        offset::{self, Memory},
        size::{Constant, SizeChooser},
        Clock, Error, Metrics,
    };
    use futures::channel::mpsc;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        time::Duration,
    };

    type TestSender = Sender<Context, mocks::Node, Memory>;

    const NODE: u32 = 0;

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn setup(cfg: Config) -> (Runner, Context, TestSender, Memory, mocks::Transmitter) {
        let (runner, context, _) = Executor::default();
        let transmitter = mocks::Transmitter::default();
        let store = Memory::default();
        store.write(NODE, offset::ZERO);
        let sender = Sender::new(
            context.with_label("node_0"),
            mocks::Node::new(NODE, transmitter.clone()),
            store.clone(),
            cfg,
        );
        (runner, context, sender, store, transmitter)
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(Some(notification)) = receiver.try_next() {
            notifications.push(notification);
        }
        notifications
    }

    fn times(notifications: &[Notification]) -> Vec<Duration> {
        notifications.iter().map(|n| n.at).collect()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.interval, secs(10));
        assert_eq!(cfg.initial_delay, secs(1));
        assert_eq!(cfg.packet_size, 10);
        assert!(matches!(cfg.size, SizeChooser::None));
    }

    #[test]
    fn test_periodic_sends() {
        let (runner, _, sender, store, transmitter) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(25));

        let notifications = drain(&mut receiver);
        assert_eq!(times(&notifications), vec![secs(1), secs(11), secs(21)]);
        for notification in &notifications {
            assert_eq!(notification.node, NODE);
            assert_eq!(notification.payload.len(), 10);
        }
        assert_eq!(transmitter.sent().len(), 3);
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));
        assert!(sender.is_running());
    }

    #[test]
    fn test_exact_interval() {
        for interval in [1, 3, 7, 60] {
            let cfg = Config {
                interval: secs(interval),
                initial_delay: Duration::ZERO,
                ..Config::default()
            };
            let (runner, _, sender, _, _) = setup(cfg);
            let mut receiver = sender.subscribe();
            sender.start().unwrap();
            runner.run_until(secs(interval * 5));

            let times = times(&drain(&mut receiver));
            assert_eq!(times.len(), 6);
            for pair in times.windows(2) {
                assert_eq!(pair[1] - pair[0], secs(interval));
            }
        }
    }

    #[test]
    fn test_offset_delays_next_cycle() {
        let (runner, _, sender, store, _) = setup(Config::default());
        store.write(NODE, "3");
        let mut receiver = sender.subscribe();
        sender.start().unwrap();

        // The first cycle consumes the offset
        runner.run_until(secs(1));
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));

        runner.run_until(secs(25));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(14), secs(24)]
        );
    }

    #[test]
    fn test_offset_reset_within_cycle() {
        let (runner, context, sender, store, _) = setup(Config::default());
        store.write(NODE, "5");
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(1));

        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));
        assert_eq!(context.pending(), 1);

        runner.run_until(secs(16));
        assert_eq!(times(&drain(&mut receiver)), vec![secs(1), secs(16)]);
    }

    #[test]
    fn test_fractional_offset() {
        let (runner, _, sender, store, _) = setup(Config::default());
        store.write(NODE, "0.5");
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(12));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), Duration::from_millis(11_500)]
        );
    }

    #[test]
    fn test_offset_written_between_cycles() {
        let (runner, context, sender, store, _) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();

        // Something outside the sender writes an offset at 5s
        {
            let store = store.clone();
            context.schedule(secs(5), move || store.write(NODE, "2"));
        }
        runner.run_until(secs(25));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(11), secs(23)]
        );
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));
    }

    #[test]
    fn test_missing_record_initialized() {
        let (runner, context, _) = Executor::default();
        let store = Memory::default();
        let sender = Sender::new(
            context,
            mocks::Node::new(NODE, mocks::Transmitter::default()),
            store.clone(),
            Config::default(),
        );
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(1));
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));

        runner.run_until(secs(11));
        assert_eq!(times(&drain(&mut receiver)), vec![secs(1), secs(11)]);
    }

    #[test]
    fn test_malformed_offset_is_fatal() {
        let (runner, _, sender, store, transmitter) = setup(Config::default());
        store.write(NODE, "soon");
        sender.start().unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| runner.run_until(secs(25))));
        assert!(result.is_err());

        // The payload went out and the record was reset before parsing failed
        assert_eq!(transmitter.sent().len(), 1);
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));
    }

    #[test]
    fn test_sender_usable_after_fatal_cycle() {
        let (runner, _, sender, store, transmitter) = setup(Config::default());
        store.write(NODE, "soon");
        sender.start().unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| runner.run_until(secs(25))));
        assert!(result.is_err());

        // The failed cycle left the sender stopped (and not poisoned)
        assert_eq!(sender.id(), NODE);
        assert!(!sender.is_running());
        sender.stop();

        // The record was reset, so a restart from 1s resumes the normal schedule
        sender.start().unwrap();
        runner.run_until(secs(25));
        assert_eq!(transmitter.sent().len(), 4);
    }

    #[test]
    fn test_negative_zero_offset() {
        let (runner, _, sender, store, _) = setup(Config::default());
        store.write(NODE, "-0");
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(1));
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));

        runner.run_until(secs(25));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(11), secs(21)]
        );
    }

    #[test]
    fn test_zero_offset_text_not_applied() {
        let (runner, context, sender, store, _) = setup(Config::default());
        store.write(NODE, "0.0");
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(25));

        // The record is reset but adds no delay
        assert_eq!(store.get(NODE).as_deref(), Some(offset::ZERO));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(11), secs(21)]
        );
        assert!(context.encode().contains("node_0_offsets_applied_total 0"));
    }

    #[test]
    #[should_panic(expected = "send cycle failed")]
    fn test_negative_offset_is_fatal() {
        let (runner, _, sender, store, _) = setup(Config::default());
        store.write(NODE, "-2");
        sender.start().unwrap();
        runner.run_until(secs(25));
    }

    #[test]
    fn test_stop_prevents_sends() {
        let (runner, context, sender, _, transmitter) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(5));
        sender.stop();
        assert!(!sender.is_running());
        assert_eq!(context.pending(), 0);

        runner.run_until(secs(100));
        assert_eq!(times(&drain(&mut receiver)), vec![secs(1)]);
        assert_eq!(transmitter.sent().len(), 1);

        // Stopping again is a no-op
        sender.stop();
        assert!(!sender.is_running());
    }

    #[test]
    fn test_stop_at_due_instant() {
        let (runner, context, sender, _, transmitter) = setup(Config::default());
        sender.start().unwrap();

        // Scheduled after the first cycle, so it fires at 11s before the second one
        {
            let sender = sender.clone();
            context.schedule(secs(11), move || sender.stop());
        }
        runner.run_until(secs(50));
        assert_eq!(transmitter.sent().len(), 1);
    }

    #[test]
    fn test_stop_before_first_cycle() {
        let (runner, _, sender, _, transmitter) = setup(Config::default());
        sender.start().unwrap();
        sender.stop();
        runner.run_until(secs(50));
        assert!(transmitter.sent().is_empty());
    }

    #[test]
    fn test_restart_after_stop() {
        let (runner, _, sender, _, _) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(5));
        sender.stop();
        runner.run_until(secs(30));
        sender.start().unwrap();
        runner.run_until(secs(45));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(31), secs(41)]
        );
    }

    #[test]
    fn test_double_start_single_pending() {
        let (runner, context, sender, _, _) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        sender.start().unwrap();
        assert_eq!(context.pending(), 1);

        runner.run_until(secs(25));
        assert_eq!(context.pending(), 1);
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(11), secs(21)]
        );
    }

    #[test]
    fn test_start_while_running_reanchors() {
        let (runner, context, sender, _, _) = setup(Config::default());
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        {
            let sender = sender.clone();
            context.schedule(secs(5), move || sender.start().unwrap());
        }
        runner.run_until(secs(20));
        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(6), secs(16)]
        );
        assert_eq!(context.pending(), 1);
    }

    #[test]
    fn test_constant_size_source() {
        let cfg = Config {
            size: SizeChooser::random(Constant(7)),
            ..Config::default()
        };
        let (runner, _, sender, _, transmitter) = setup(cfg);
        sender.start().unwrap();
        runner.run_until(secs(25));

        let sent = transmitter.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|payload| payload.len() == 17));
    }

    #[test]
    fn test_reconfigure() {
        let (runner, _, sender, _, transmitter) = setup(Config::default());
        sender.set_packet_size(20);
        sender.set_initial_delay(secs(2));
        sender.start().unwrap();
        runner.run_until(secs(2));

        // The pending cycle keeps its time, later cycles use the new interval
        sender.set_interval(secs(5));
        assert_eq!(sender.interval(), secs(5));
        sender.set_packet_size_source(SizeChooser::random(Constant(1)));
        runner.run_until(secs(17));

        let sent: Vec<_> = transmitter.sent().iter().map(|p| p.len()).collect();
        assert_eq!(sent, vec![20, 21, 21]);
    }

    #[test]
    fn test_max_packet_size() {
        let cfg = Config {
            packet_size: u8::MAX,
            size: SizeChooser::random(Constant(1)),
            ..Config::default()
        };
        let (runner, _, sender, _, transmitter) = setup(cfg);
        sender.start().unwrap();
        runner.run_until(secs(1));
        assert_eq!(transmitter.sent()[0].len(), 256);
    }

    #[test]
    fn test_missing_transmitter() {
        let (_, context, _) = Executor::default();
        let sender = Sender::new(
            context.clone(),
            mocks::Node::detached(3),
            Memory::default(),
            Config::default(),
        );
        assert!(matches!(sender.start(), Err(Error::TransmitterMissing(3))));
        assert!(!sender.is_running());
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_bound_transmitter() {
        let (runner, context, _) = Executor::default();
        let sender = Sender::new(
            context,
            mocks::Node::detached(3),
            Memory::default(),
            Config::default(),
        );
        let transmitter = mocks::Transmitter::default();
        sender.bind(transmitter.clone());
        sender.start().unwrap();
        runner.run_until(secs(1));
        assert_eq!(transmitter.sent().len(), 1);
    }

    #[test]
    fn test_senders_share_clock() {
        let (runner, context, _) = Executor::default();
        let transmitter = mocks::Transmitter::default();
        let store = Memory::default();
        store.write(1, "5");
        let senders: Vec<_> = (0..2u32)
            .map(|id| {
                let cfg = Config {
                    packet_size: id as u8 + 1,
                    ..Config::default()
                };
                Sender::new(
                    context.with_label(&format!("node_{id}")),
                    mocks::Node::new(id, transmitter.clone()),
                    store.clone(),
                    cfg,
                )
            })
            .collect();
        for sender in &senders {
            sender.start().unwrap();
        }
        runner.run_until(secs(21));

        // Same instant fires in start order, node 1 is delayed once by 5s
        let sent: Vec<_> = transmitter.sent().iter().map(|p| p.len()).collect();
        assert_eq!(sent, vec![1, 2, 1, 2, 1]);
        assert_eq!(store.get(1).as_deref(), Some(offset::ZERO));
        assert_eq!(context.pending(), 2);
    }

    #[test]
    fn test_dropped_subscriber() {
        let (runner, _, sender, _, _) = setup(Config::default());
        let dropped = sender.subscribe();
        let mut receiver = sender.subscribe();
        drop(dropped);
        sender.start().unwrap();
        runner.run_until(secs(11));
        assert_eq!(drain(&mut receiver).len(), 2);
    }

    #[test]
    fn test_dropped_sender() {
        let (runner, context, sender, _, transmitter) = setup(Config::default());
        sender.start().unwrap();
        drop(sender);
        runner.run_until(secs(25));
        assert!(transmitter.sent().is_empty());
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn test_metrics() {
        let (runner, context, sender, store, _) = setup(Config::default());
        store.write(NODE, "3");
        sender.start().unwrap();
        runner.run_until(secs(25));

        let buffer = context.encode();
        assert!(buffer.contains("node_0_sent_total 3"));
        assert!(buffer.contains("node_0_sent_bytes_total 30"));
        assert!(buffer.contains("node_0_offsets_applied_total 1"));
    }

    #[test]
    fn test_directory_store() {
        let path = std::env::temp_dir().join(format!(
            "periodic-sender-cycle-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        let store = offset::Directory::new(offset::Config::new(&path));
        store.write(NODE, "3").unwrap();

        let (runner, context, _) = Executor::default();
        let sender = Sender::new(
            context,
            mocks::Node::new(NODE, mocks::Transmitter::default()),
            store,
            Config::default(),
        );
        let mut receiver = sender.subscribe();
        sender.start().unwrap();
        runner.run_until(secs(25));

        assert_eq!(
            times(&drain(&mut receiver)),
            vec![secs(1), secs(14), secs(24)]
        );
        assert_eq!(
            std::fs::read_to_string(path.join("0.txt")).unwrap(),
            "0\n"
        );
        let _ = std::fs::remove_dir_all(&path);
    }
}
