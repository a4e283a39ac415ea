mod common;
use common::node;

use volley_core::context;
use volley_core::term::Term;

#[test]
fn messages_arrive_in_send_order() {
    let n = node();
    let receiver = n.spawn();
    for i in 1..=3 {
        assert!(n.send_immediate(receiver, Term::from_int(i)));
    }
    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();
        assert_eq!(ctx.mailbox.len(), 3);
        for i in 1..=3 {
            let message = ctx.remove_message().unwrap().unwrap();
            assert_eq!(message.to_int(), i);
        }
        assert!(ctx.remove_message().unwrap().is_none());
    });
}

#[test]
fn send_sets_message_ready_flag() {
    let n = node();
    let receiver = n.spawn();
    let slot = n.global.get_process_slot(receiver).unwrap();
    assert_eq!(slot.flags() & context::MESSAGE_READY, 0);
    n.send_immediate(receiver, Term::from_int(1));
    assert_ne!(slot.flags() & context::MESSAGE_READY, 0);
}

#[test]
fn send_to_gone_process_reports_failure() {
    let n = node();
    let receiver = n.spawn();
    n.destroy(receiver);
    assert!(!n.send_immediate(receiver, Term::from_int(1)));
}

#[test]
fn selective_receive_skips_and_preserves_order() {
    let n = node();
    let receiver = n.spawn();
    n.send_immediate(receiver, Term::from_int(1));
    n.send_immediate(receiver, n.atom("hello"));
    n.send_immediate(receiver, Term::from_int(2));

    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();

        // receive X when is_atom(X) -> X end
        let received = loop {
            let Some(fragment) = ctx.mailbox.peek() else {
                panic!("no matching message");
            };
            if fragment.term().is_atom() {
                break ctx.remove_message().unwrap().unwrap();
            }
            ctx.mailbox.next();
        };
        assert_eq!(received, n.atom("hello"));

        // The skipped messages are retained, in order, cursor reset
        assert_eq!(ctx.mailbox.len(), 2);
        assert_eq!(ctx.mailbox.peek().unwrap().term().to_int(), 1);
        ctx.mailbox.next();
        assert_eq!(ctx.mailbox.peek().unwrap().term().to_int(), 2);
        ctx.mailbox.next();
        assert!(ctx.mailbox.peek().is_none());
    });
}

#[test]
fn failed_receive_leaves_mailbox_unchanged_after_reset() {
    let n = node();
    let receiver = n.spawn();
    n.send_immediate(receiver, Term::from_int(1));
    n.send_immediate(receiver, Term::from_int(2));

    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();
        while ctx.mailbox.peek().is_some() {
            ctx.mailbox.next();
        }
        ctx.mailbox.reset();
        assert_eq!(ctx.mailbox.len(), 2);
        assert_eq!(ctx.mailbox.peek().unwrap().term().to_int(), 1);
    });
}

#[test]
fn boxed_messages_are_deep_copied_between_heaps() {
    let n = node();
    let sender = n.spawn();
    let receiver = n.spawn();

    n.with_ctx(sender, |ctx| {
        ctx.ensure_free(3).unwrap();
        let tuple = Term::alloc_tuple(2, &mut ctx.heap).unwrap();
        tuple.put_tuple_element(&mut ctx.heap, 0, n.atom("ping"));
        tuple.put_tuple_element(&mut ctx.heap, 1, Term::from_int(7));
        assert!(n.global.send(receiver, ctx.heap.cells(), tuple));
    });

    // The sender can die before the receiver looks at the message
    n.destroy(sender);

    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();
        let message = ctx.remove_message().unwrap().unwrap();
        let cells = ctx.heap.cells();
        assert!(message.is_tuple(cells));
        assert_eq!(message.tuple_element(cells, 0), n.atom("ping"));
        assert_eq!(message.tuple_element(cells, 1).to_int(), 7);
    });
}

#[test]
fn remove_message_triggers_collection_when_needed() {
    let n = node();
    let sender = n.spawn_with_heap_size(4096);
    let receiver = n.spawn();

    n.with_ctx(sender, |ctx| {
        ctx.ensure_free(2048).unwrap();
        let mut list = Term::NIL;
        for i in 0..200 {
            list = Term::make_list(Term::from_int(i), list, &mut ctx.heap).unwrap();
        }
        assert!(n.global.send(receiver, ctx.heap.cells(), list));
    });

    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();
        let mut list = ctx.remove_message().unwrap().unwrap();
        let cells = ctx.heap.cells();
        for i in (0..200).rev() {
            assert_eq!(list.list_head(cells).to_int(), i);
            list = list.list_tail(cells);
        }
        assert!(list.is_nil());
    });
}

#[test]
fn mailbox_len_and_size_count_pending_envelopes() {
    let n = node();
    let receiver = n.spawn();
    n.send_immediate(receiver, Term::from_int(1));
    n.with_ctx(receiver, |ctx| {
        // Outer queue counts before the owner drains it
        assert_eq!(ctx.message_queue_len(), 1);
        assert_eq!(ctx.mailbox.size(), 0); // immediates carry no cells
        ctx.mailbox.process_outer();
        assert_eq!(ctx.message_queue_len(), 1);
    });

    n.with_ctx(receiver, |ctx| {
        ctx.ensure_free(3).unwrap();
        let tuple = Term::alloc_tuple(2, &mut ctx.heap).unwrap();
        tuple.put_tuple_element(&mut ctx.heap, 0, Term::from_int(1));
        tuple.put_tuple_element(&mut ctx.heap, 1, Term::from_int(2));
        n.global.send(receiver, ctx.heap.cells(), tuple);
        assert_eq!(ctx.message_queue_len(), 2);
        assert_eq!(ctx.mailbox.size(), 3);
    });
}

#[test]
fn interleaved_senders_each_keep_fifo_order() {
    let n = node();
    let receiver = n.spawn();
    let a = n.atom("a");
    let b = n.atom("b");
    n.send_immediate(receiver, a);
    n.send_immediate(receiver, b);
    n.send_immediate(receiver, a);

    n.with_ctx(receiver, |ctx| {
        ctx.mailbox.process_outer();
        let first = ctx.remove_message().unwrap().unwrap();
        let second = ctx.remove_message().unwrap().unwrap();
        let third = ctx.remove_message().unwrap().unwrap();
        assert_eq!((first, second, third), (a, b, a));
    });
}
