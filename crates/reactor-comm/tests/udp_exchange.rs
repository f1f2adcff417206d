//! Cross-module UDP exchange: a `Comm` UDP reader on one socket observes
//! datagrams sent by a `Comm` UDP writer on another, driven entirely through
//! the reactor's own loop (no raw `std::net` sockets on the receiving side).

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use reactor_comm::{udp_bind, Comm, CommStatus};
use reactor_core::Reactor;
use reactor_shm::NetBuf;

fn local_udp() -> (Rc<RefCell<Comm>>, SocketAddr) {
    let comm = udp_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
    let addr = {
        let fd = comm.borrow().fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(fd, std::ptr::addr_of_mut!(storage).cast(), &mut len) };
        assert_eq!(rc, 0);
        let sin = unsafe { &*(std::ptr::addr_of!(storage).cast::<libc::sockaddr_in>()) };
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()))), u16::from_be(sin.sin_port))
    };
    (comm, addr)
}

fn run_until<F: Fn() -> bool>(reactor: &mut Reactor, deadline: Instant, done: F) {
    while !done() {
        reactor.run_once(Duration::from_millis(20)).unwrap();
        assert!(Instant::now() < deadline, "timed out waiting for condition");
    }
}

#[test]
fn udp_frame_round_trips_through_reactor_driven_comms() {
    let mut reactor = Reactor::new().unwrap();

    let (reader, reader_addr) = local_udp();
    let (writer, _writer_addr) = local_udp();

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let received_cb = received.clone();
    reader.borrow_mut().udp_read(
        &mut reactor,
        None,
        1500,
        Box::new(move |_comm, _reactor, frame, _peer, status| {
            assert!(matches!(status, CommStatus::Completed));
            received_cb.borrow_mut().extend_from_slice(frame.as_slice());
        }),
    );

    let send_completed = Rc::new(RefCell::new(false));
    let send_completed_cb = send_completed.clone();
    writer.borrow_mut().udp_write_setup(
        &mut reactor,
        8,
        Box::new(move |_comm, _reactor, _frame, status| {
            assert!(matches!(status, CommStatus::Completed));
            *send_completed_cb.borrow_mut() = true;
        }),
    );

    let mut frame = NetBuf::heap(5);
    frame.as_mut_slice().copy_from_slice(b"hello");
    writer.borrow_mut().udp_write(&mut reactor, reader_addr, frame).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    run_until(&mut reactor, deadline, || *send_completed.borrow() && !received.borrow().is_empty());

    assert_eq!(&*received.borrow(), b"hello");
}

#[test]
fn udp_write_backpressure_rejects_synchronously_once_queue_is_full() {
    let mut reactor = Reactor::new().unwrap();
    let (writer, _addr) = local_udp();
    // Bind a receiver too, so sends have somewhere to go -- an unbound
    // remote would still accept queuing (backpressure is about queue
    // depth, not deliverability).
    let (_receiver, receiver_addr) = local_udp();

    writer.borrow_mut().udp_write_setup(&mut reactor, 2, Box::new(|_comm, _reactor, _frame, _status| {}));

    let first = NetBuf::heap(4);
    let second = NetBuf::heap(4);
    let third = NetBuf::heap(4);

    assert!(writer.borrow_mut().udp_write(&mut reactor, receiver_addr, first).is_ok());
    assert!(writer.borrow_mut().udp_write(&mut reactor, receiver_addr, second).is_ok());
    // Queue is now at max_qlen=2's worth of in-flight sends (the reactor
    // hasn't drained them yet since no run_once has happened), so a third
    // enqueue must fail synchronously and hand the frame straight back.
    match writer.borrow_mut().udp_write(&mut reactor, receiver_addr, third) {
        Err(_returned) => {}
        Ok(()) => panic!("expected backpressure rejection at max_qlen"),
    }
}
