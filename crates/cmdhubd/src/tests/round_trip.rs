//! End-to-end exchanges through the real transports and the client library.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::{
    REGISTER_STATE_LISTENER, StatusCode, read_i32, read_text_frame, write_frame,
};
use rstest::rstest;

use super::support::{LiveDaemon, PATIENCE, TestExecutor, Transport};
use crate::admission::HandlePool;
use crate::bridge::{Progress, SyncListener};
use crate::context::{ExecutionContext, OutputBuffer, Services};

fn daemon(transport: Transport) -> LiveDaemon {
    LiveDaemon::start(transport, Arc::new(TestExecutor::default()))
}

#[rstest]
#[case(Transport::Unix, 0)]
#[case(Transport::Unix, 12)]
#[case(Transport::Unix, 48 * 1024)]
#[case(Transport::Tcp, 0)]
#[case(Transport::Tcp, 12)]
#[case(Transport::Tcp, 48 * 1024)]
#[case(Transport::Pipe, 0)]
#[case(Transport::Pipe, 12)]
#[case(Transport::Pipe, 48 * 1024)]
fn responses_arrive_whole(#[case] transport: Transport, #[case] size: usize) {
    let daemon = daemon(transport);
    let command = if size == 0 {
        String::from("silent")
    } else {
        format!("bytes {size}")
    };

    let (status, output) = daemon.run(&command, false);

    assert_eq!(status, StatusCode::OK);
    assert_eq!(output.len(), size);
    assert!(output.bytes().all(|byte| byte.is_ascii_lowercase()));
}

#[rstest]
#[case(Transport::Unix)]
#[case(Transport::Tcp)]
#[case(Transport::Pipe)]
fn parallel_clients_get_their_own_answers(#[case] transport: Transport) {
    let daemon = Arc::new(daemon(transport));
    let clients: Vec<_> = (0..6)
        .map(|index| {
            let daemon = Arc::clone(&daemon);
            thread::spawn(move || (index, daemon.run(&format!("slow client-{index}"), false)))
        })
        .collect();

    for client in clients {
        let (index, (status, output)) = client.join().expect("client thread");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(output, format!("client-{index}\n").repeat(5));
    }
}

#[rstest]
#[case(true, StatusCode::OK, "confirmed\n")]
#[case(false, StatusCode::NOT_PERMITTED, "declined\n")]
fn socket_clients_answer_confirmations(
    #[case] answer: bool,
    #[case] status: StatusCode,
    #[case] output: &str,
) {
    let daemon = daemon(Transport::Unix);
    assert_eq!(
        daemon.run("confirm Overwrite the file?", answer),
        (status, output.to_owned())
    );
}

#[rstest]
fn pipe_clients_are_never_asked() {
    let daemon = daemon(Transport::Pipe);
    assert_eq!(
        daemon.run("confirm Overwrite the file?", true),
        (StatusCode::NOT_PERMITTED, String::from("declined\n"))
    );
}

#[rstest]
fn pipes_refuse_state_listeners() {
    let daemon = daemon(Transport::Pipe);
    let (status, output) = daemon.run(REGISTER_STATE_LISTENER, false);
    assert_eq!(status, StatusCode::INVALID_STATE);
    assert!(output.contains("does not support state listeners"));
}

/// Registers a listener by hand and returns its channel and client id.
fn register(endpoint: &SocketEndpoint) -> (UnixStream, u64) {
    let path = endpoint.filesystem_path().expect("unix endpoint");
    let mut request = UnixStream::connect(path.as_std_path()).expect("connect");
    write_frame(&mut request, REGISTER_STATE_LISTENER.as_bytes()).expect("register");
    let id = u32::try_from(read_i32(&mut request).expect("petition id")).expect("positive id");
    let response = endpoint.response_endpoint(id).expect("response endpoint");
    let response_path = response.filesystem_path().expect("response path");
    let mut channel = UnixStream::connect(response_path.as_std_path()).expect("connect channel");
    channel
        .set_read_timeout(Some(PATIENCE))
        .expect("read timeout");
    let announcement = read_text_frame(&mut channel).expect("client id push");
    let client_id = announcement
        .strip_prefix("clientID:")
        .and_then(|id| id.parse().ok())
        .expect("client id");
    (channel, client_id)
}

#[rstest]
fn notifications_reach_registered_listeners() {
    let daemon = daemon(Transport::Unix);
    let (mut channel, client_id) = register(&daemon.endpoint);

    let (status, output) = daemon.run(&format!("notify {client_id} sync finished"), false);

    assert_eq!(status, StatusCode::OK, "{output}");
    assert_eq!(read_text_frame(&mut channel).expect("push"), "sync finished");
}

#[rstest]
fn departed_listeners_are_pruned() {
    let daemon = daemon(Transport::Unix);
    let (channel, _) = register(&daemon.endpoint);
    let (_kept, kept_id) = register(&daemon.endpoint);
    assert_eq!(daemon.comms.state_listeners().len(), 2);
    drop(channel);

    let deadline = Instant::now() + PATIENCE;
    while daemon.comms.state_listeners().len() > 1 {
        assert!(Instant::now() < deadline, "departed listener was never pruned");
        daemon.comms.inform_state_listeners("ack");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(daemon.comms.state_listeners().client_ids(), [kept_id]);
}

#[rstest]
fn unknown_listeners_are_reported() {
    let daemon = daemon(Transport::Tcp);
    let (status, output) = daemon.run("notify 99 hello", false);
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(output.contains("no state listener with client id 99"));
}

#[rstest]
fn transfer_progress_reaches_the_listener() {
    let daemon = daemon(Transport::Unix);
    let (mut channel, client_id) = register(&daemon.endpoint);
    let services = Services::new(
        Arc::new(HandlePool::secondary(1)),
        Some(Arc::clone(&daemon.comms)),
    );
    let mut confirm = |_: &str| false;
    let context = ExecutionContext::for_petition(OutputBuffer::new(), &mut confirm, &services);
    let sink = context.progress_sink(client_id).expect("progress sink");

    let listener = SyncListener::<u64>::with_progress(sink);
    let result = listener.submit_and_wait(|completion| {
        completion.progress(&Progress {
            transferred: 512,
            total: 2048,
            title: String::from("photos.zip"),
        });
        completion.complete(Ok(2048));
    });

    assert_eq!(result, Ok(2048));
    assert_eq!(
        read_text_frame(&mut channel).expect("progress push"),
        "progress:512:2048:photos.zip"
    );
}
