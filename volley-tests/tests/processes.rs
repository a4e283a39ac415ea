mod common;
use common::node;

use std::sync::Arc;
use std::thread;
use volley_core::atom_table::{BADARG_ATOM, NORMAL_ATOM, TRUE_ATOM, UNDEFINED_ATOM};
use volley_core::context;
use volley_core::nifs::NIF_REGISTRY;
use volley_core::scheduler::ProcessStatus;
use volley_core::term::Term;

#[test]
fn spawn_registers_in_the_process_table() {
    let n = node();
    let pid = n.spawn();
    assert_eq!(n.global.process_count(), 1);
    n.with_ctx(pid, |ctx| {
        assert_eq!(ctx.pid(), pid);
        assert_eq!(ctx.exit_reason, NORMAL_ATOM);
        assert!(!ctx.trap_exit);
        assert_eq!(ctx.message_queue_len(), 0);
    });
}

#[test]
fn spawn_send_receive_reply() {
    let n = node();
    let ponger = n.spawn();
    let pinger = n.spawn();

    // pinger ! {ping, self()} to ponger
    n.with_ctx(pinger, |ctx| {
        ctx.ensure_free(3).unwrap();
        let message = Term::alloc_tuple(2, &mut ctx.heap).unwrap();
        message.put_tuple_element(&mut ctx.heap, 0, n.atom("ping"));
        message.put_tuple_element(&mut ctx.heap, 1, Term::from_local_process_id(pinger));
        assert!(n.global.send(ponger, ctx.heap.cells(), message));
    });

    // ponger receives and replies pong
    n.with_ctx(ponger, |ctx| {
        ctx.mailbox.process_outer();
        let message = ctx.remove_message().unwrap().unwrap();
        let cells = ctx.heap.cells();
        assert_eq!(message.tuple_element(cells, 0), n.atom("ping"));
        let reply_to = message.tuple_element(cells, 1).to_local_process_id();
        assert!(n.global.send(reply_to, &[], n.atom("pong")));
    });

    n.with_ctx(pinger, |ctx| {
        ctx.mailbox.process_outer();
        let reply = ctx.remove_message().unwrap().unwrap();
        assert_eq!(reply, n.atom("pong"));
    });

    // Both terminate normally
    n.with_ctx(ponger, |ctx| assert_eq!(ctx.exit_reason, NORMAL_ATOM));
    assert!(n.destroy(ponger));
    assert!(n.destroy(pinger));
    assert_eq!(n.global.process_count(), 0);
}

#[test]
fn process_info_reports_known_keys() {
    let n = node();
    let pid = n.spawn();
    n.send_immediate(pid, Term::from_int(1));
    n.with_ctx(pid, |ctx| {
        ctx.mailbox.process_outer();

        let info = ctx.process_info(n.atom("heap_size")).unwrap();
        let cells = ctx.heap.cells();
        assert_eq!(info.tuple_element(cells, 0), n.atom("heap_size"));
        let heap_words = info.tuple_element(cells, 1).to_int();
        assert_eq!(heap_words as usize, ctx.heap.capacity());

        let info = ctx.process_info(n.atom("stack_size")).unwrap();
        let cells = ctx.heap.cells();
        assert_eq!(info.tuple_element(cells, 1).to_int(), 0);

        let info = ctx.process_info(n.atom("message_queue_len")).unwrap();
        let cells = ctx.heap.cells();
        assert_eq!(info.tuple_element(cells, 1).to_int(), 1);

        let info = ctx.process_info(n.atom("memory")).unwrap();
        let cells = ctx.heap.cells();
        assert!(info.tuple_element(cells, 1).to_int() > 0);
    });
}

#[test]
fn process_info_rejects_unknown_keys() {
    let n = node();
    let pid = n.spawn();
    n.with_ctx(pid, |ctx| {
        assert_eq!(ctx.process_info(n.atom("garbage_key")).unwrap_err(), BADARG_ATOM);
    });
}

#[test]
fn register_whereis_unregister() {
    let n = node();
    let pid = n.spawn();
    let name = n.atom("worker").atom_index();

    assert!(n.global.register_name(name, pid));
    assert_eq!(n.global.whereis(name), Some(pid));
    // A name can only be taken once
    assert!(!n.global.register_name(name, pid));

    assert_eq!(n.global.unregister_name(name), Some(pid));
    assert_eq!(n.global.whereis(name), None);
}

#[test]
fn destroy_unregisters_names() {
    let n = node();
    let pid = n.spawn();
    let name = n.atom("short_lived").atom_index();
    assert!(n.global.register_name(name, pid));
    assert!(n.destroy(pid));
    assert_eq!(n.global.whereis(name), None);
}

#[test]
fn destroy_makes_lookups_fail() {
    let n = node();
    let pid = n.spawn();
    assert!(n.destroy(pid));
    assert!(n.global.with_locked_process(pid, |_| ()).is_none());
    assert_eq!(n.global.process_count(), 0);
    // Destroying again is a no-op
    assert!(!n.destroy(pid));
}

#[test]
fn scheduler_ready_protocol() {
    let n = node();
    let pid = n.spawn();
    assert_eq!(n.scheduler.status(&n.global, pid), ProcessStatus::Waiting);

    n.scheduler.make_ready(&n.global, pid);
    assert_eq!(n.scheduler.status(&n.global, pid), ProcessStatus::Queued);
    // Queueing twice is idempotent
    n.scheduler.make_ready(&n.global, pid);
    assert_eq!(n.scheduler.run_queue_len(), 1);

    assert_eq!(n.scheduler.next_ready(&n.global), Some(pid));
    assert_eq!(n.scheduler.status(&n.global, pid), ProcessStatus::Running);

    n.scheduler.suspend(&n.global, pid);
    assert_eq!(n.scheduler.status(&n.global, pid), ProcessStatus::Waiting);

    n.destroy(pid);
    assert_eq!(n.scheduler.status(&n.global, pid), ProcessStatus::Terminated);
}

#[test]
fn receive_timeout_fires_and_requeues() {
    let n = node();
    let pid = n.spawn();
    n.scheduler.set_timeout(&n.global, pid, 50, 1000);

    let slot = n.global.get_process_slot(pid).unwrap();
    assert_ne!(slot.flags() & context::WAITING_TIMEOUT, 0);
    assert_eq!(n.scheduler.next_timer_deadline(), Some(1050));

    assert_eq!(n.scheduler.process_timeouts(&n.global, 1049), 0);
    assert_eq!(n.scheduler.process_timeouts(&n.global, 1050), 1);

    let flags = slot.flags();
    assert_ne!(flags & context::TIMED_OUT, 0);
    assert_ne!(flags & context::MESSAGE_READY, 0);
    assert_eq!(flags & context::WAITING_TIMEOUT, 0);
    assert_eq!(n.scheduler.next_ready(&n.global), Some(pid));
}

#[test]
fn cancelled_timeout_never_fires() {
    let n = node();
    let pid = n.spawn();
    n.scheduler.set_timeout(&n.global, pid, 50, 0);
    n.scheduler.cancel_timeout(&n.global, pid);

    let slot = n.global.get_process_slot(pid).unwrap();
    assert_eq!(slot.flags() & context::WAITING_TIMEOUT, 0);
    assert_eq!(n.scheduler.process_timeouts(&n.global, 10_000), 0);
    assert_eq!(n.scheduler.next_timer_deadline(), None);
}

#[test]
fn destroy_cancels_pending_timers() {
    let n = node();
    let pid = n.spawn();
    n.scheduler.set_timeout(&n.global, pid, 50, 0);
    n.scheduler.make_ready(&n.global, pid);
    assert!(n.destroy(pid));
    assert_eq!(n.scheduler.next_timer_deadline(), None);
    assert_eq!(n.scheduler.run_queue_len(), 0);
}

#[test]
fn concurrent_flag_updates_serialize() {
    let n = node();
    let pid = n.spawn();
    let slot = n.global.get_process_slot(pid).unwrap();

    let mut handles = Vec::new();
    for bit in 8..16u32 {
        let slot = Arc::clone(&slot);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                slot.update_flags(!0, 1 << bit);
                slot.update_flags(!(1 << bit), 0);
            }
            slot.update_flags(!0, 1 << bit);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(slot.flags() & 0xFF00, 0xFF00);
}

#[test]
fn clean_registers_drops_dead_roots() {
    let n = node();
    let pid = n.spawn();
    n.with_ctx(pid, |ctx| {
        ctx.ensure_free(4).unwrap();
        let garbage = Term::alloc_tuple(3, &mut ctx.heap).unwrap();
        ctx.x[0] = garbage;
        ctx.x[5] = garbage;
        ctx.clean_registers(1);
        assert!(ctx.x[5].is_invalid());
        ctx.garbage_collect(0).unwrap();
        // Only the live register kept the tuple alive
        assert_eq!(ctx.heap.used(), 4);
    });
}

#[test]
fn dictionary_put_get_erase() {
    let n = node();
    let pid = n.spawn();
    n.with_ctx(pid, |ctx| {
        let key = n.atom("counter");
        assert_eq!(ctx.dictionary_put(key, Term::from_int(1)), None);
        assert_eq!(ctx.dictionary_put(key, Term::from_int(2)), Some(Term::from_int(1)));
        assert_eq!(ctx.dictionary_get(key), Some(Term::from_int(2)));
        assert_eq!(ctx.dictionary_erase(key), Some(Term::from_int(2)));
        assert_eq!(ctx.dictionary_get(key), None);
    });
}

#[test]
fn dictionary_entries_survive_collection() {
    let n = node();
    let pid = n.spawn();
    n.with_ctx(pid, |ctx| {
        ctx.ensure_free(3).unwrap();
        let value = Term::alloc_tuple(2, &mut ctx.heap).unwrap();
        value.put_tuple_element(&mut ctx.heap, 0, Term::from_int(1));
        value.put_tuple_element(&mut ctx.heap, 1, Term::from_int(2));
        ctx.dictionary_put(n.atom("state"), value);

        ctx.garbage_collect(0).unwrap();

        let value = ctx.dictionary_get(n.atom("state")).unwrap();
        let cells = ctx.heap.cells();
        assert_eq!(value.tuple_element(cells, 0).to_int(), 1);
        assert_eq!(value.tuple_element(cells, 1).to_int(), 2);
    });
}

#[test]
fn nif_registry_resolves_process_builtins() {
    assert!(NIF_REGISTRY.get("erlang:self/0").is_some());
    assert!(NIF_REGISTRY.get("erlang:send/2").is_some());
    assert!(NIF_REGISTRY.get("erlang:spawn/1").is_some());
    assert!(NIF_REGISTRY.get("erlang:monitor/2").is_some());
    assert!(NIF_REGISTRY.get("lists:reverse/1").is_none());
    assert!(NIF_REGISTRY.names().contains(&"erlang:process_info/2"));
}

#[test]
fn nif_spawn_seeds_the_new_process_with_the_entry_closure() {
    let n = node();
    let parent = n.spawn();
    let nif_spawn = NIF_REGISTRY.get("erlang:spawn/1").unwrap();

    let child = n.with_ctx(parent, |ctx| {
        ctx.ensure_free(3).unwrap();
        let env = [Term::from_int(7)];
        let entry = Term::alloc_closure(11, &env, &mut ctx.heap).unwrap();
        let pid = nif_spawn(ctx, &[entry]).unwrap();
        assert!(pid.is_pid());
        pid.to_local_process_id()
    });

    assert_ne!(child, parent);
    assert_eq!(n.global.process_count(), 2);
    n.with_ctx(child, |ctx| {
        let cells = ctx.heap.cells();
        assert!(ctx.x[0].is_function(cells));
        assert_eq!(ctx.x[0].closure_function_id(cells), 11);
        assert_eq!(ctx.x[0].closure_env_element(cells, 0).to_int(), 7);
        assert_eq!(ctx.exit_reason, NORMAL_ATOM);
    });
}

#[test]
fn nif_spawn_rejects_non_functions() {
    let n = node();
    let parent = n.spawn();
    let nif_spawn = NIF_REGISTRY.get("erlang:spawn/1").unwrap();
    n.with_ctx(parent, |ctx| {
        assert!(nif_spawn(ctx, &[Term::from_int(1)]).is_err());
    });
    assert_eq!(n.global.process_count(), 1);
}

#[test]
fn nif_self_and_send_round_trip() {
    let n = node();
    let a = n.spawn();
    let b = n.spawn();
    let nif_self = NIF_REGISTRY.get("erlang:self/0").unwrap();
    let nif_send = NIF_REGISTRY.get("erlang:send/2").unwrap();

    n.with_ctx(a, |ctx| {
        let own = nif_self(ctx, &[]).unwrap();
        assert_eq!(own, Term::from_local_process_id(a));
        let sent = nif_send(ctx, &[Term::from_local_process_id(b), n.atom("hi")]).unwrap();
        assert_eq!(sent, n.atom("hi"));
    });
    n.with_ctx(b, |ctx| {
        ctx.mailbox.process_outer();
        assert_eq!(ctx.remove_message().unwrap().unwrap(), n.atom("hi"));
    });
}

#[test]
fn nif_register_and_whereis() {
    let n = node();
    let pid = n.spawn();
    let nif_register = NIF_REGISTRY.get("erlang:register/2").unwrap();
    let nif_whereis = NIF_REGISTRY.get("erlang:whereis/1").unwrap();

    n.with_ctx(pid, |ctx| {
        let name = n.atom("singleton");
        let target = Term::from_local_process_id(pid);
        assert_eq!(nif_register(ctx, &[name, target]).unwrap(), TRUE_ATOM);
        assert_eq!(nif_whereis(ctx, &[name]).unwrap(), target);
        assert_eq!(nif_whereis(ctx, &[n.atom("nobody")]).unwrap(), UNDEFINED_ATOM);
        assert!(nif_register(ctx, &[name, target]).is_err());
    });
}

#[test]
fn nif_dictionary_round_trip() {
    let n = node();
    let pid = n.spawn();
    let nif_put = NIF_REGISTRY.get("erlang:put/2").unwrap();
    let nif_get = NIF_REGISTRY.get("erlang:get/1").unwrap();
    let nif_erase = NIF_REGISTRY.get("erlang:erase/1").unwrap();

    n.with_ctx(pid, |ctx| {
        let key = n.atom("k");
        assert_eq!(nif_put(ctx, &[key, Term::from_int(1)]).unwrap(), UNDEFINED_ATOM);
        assert_eq!(nif_put(ctx, &[key, Term::from_int(2)]).unwrap(), Term::from_int(1));
        assert_eq!(nif_get(ctx, &[key]).unwrap(), Term::from_int(2));
        assert_eq!(nif_erase(ctx, &[key]).unwrap(), Term::from_int(2));
        assert_eq!(nif_get(ctx, &[key]).unwrap(), UNDEFINED_ATOM);
    });
}
