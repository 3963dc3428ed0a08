//! Exercises the concrete `mio` bridge end to end: a real accepted TCP
//! socket is registered with a [`NetworkStackDriver`], handed to `dispatch`,
//! and the driver's background poll loop is driven until its wakeup reaches
//! the chosen Herder's Readiness Engine and a job comes out the other end.

use std::io::Write;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};

use tcpherder::socket::{NetworkStackDriver, Socket};
use tcpherder::worker_pool::ChannelWorkerPool;
use tcpherder::{destroy_pool, dispatch, init_pool, HerderConfig};

#[test]
fn mio_socket_wakeup_reaches_herder_readiness_engine() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut listener = MioTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_poll = Poll::new().unwrap();
    accept_poll
        .registry()
        .register(&mut listener, Token(0), Interest::READABLE)
        .unwrap();

    let mut client = StdTcpStream::connect(addr).unwrap();

    let mut accept_events = Events::with_capacity(4);
    accept_poll
        .poll(&mut accept_events, Some(Duration::from_secs(5)))
        .unwrap();
    let (accepted, _peer) = listener.accept().unwrap();

    let driver = Arc::new(NetworkStackDriver::new().unwrap());
    let socket = driver.register(accepted).unwrap();

    let (pool, rx) = ChannelWorkerPool::new(16);
    let config = HerderConfig {
        cpu_ids: Some(vec![0]),
        wait_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let herder_list = init_pool(Arc::new(pool), config).unwrap();

    dispatch(&herder_list, socket.clone() as Arc<dyn Socket>).unwrap();

    // The accepted socket carries no pending data yet, so nothing is ready
    // until the client writes something for the driver's poll loop to see.
    client.write_all(b"ping").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_driver = stop.clone();
    let driver_thread = driver.clone().spawn(move || stop_for_driver.load(Ordering::Acquire));

    let job = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("herder should forward the now-readable connection to the worker pool");
    assert_eq!(job.connection.remote_endpoint(), socket.remote_endpoint());
    assert!(job.events.intersects(tcpherder::EventMask::READABLE));

    stop.store(true, Ordering::Release);
    driver_thread.join().unwrap();
    driver.deregister(&socket);
    destroy_pool(herder_list).unwrap();
}
