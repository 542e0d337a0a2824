//! Process workers driven through the built server binary.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const SIGNATURE: &str = "Server written by X";

struct ServerProcess {
    child: Child,
    addr: String,
    dir: PathBuf,
}

impl ServerProcess {
    fn start(name: &str, shutdown: &str, timeout: u64) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "fullname-server-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = format!(
            r#"{{
                "address": "127.0.0.1",
                "port": "{port}",
                "log_file_name": "{}",
                "error_log_file_name": "{}",
                "timeout": {timeout},
                "worker": "process",
                "shutdown": "{shutdown}",
                "signature": "{SIGNATURE}"
            }}"#,
            dir.join("log_file.txt").display(),
            dir.join("error_log_file.txt").display(),
        );
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, config).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_fullname-server"))
            .arg("--config")
            .arg(&config_path)
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let server = ServerProcess {
            child,
            addr: format!("127.0.0.1:{port}"),
            dir,
        };
        server.wait_for_log("log_file.txt", "Server listening");
        server
    }

    fn log(&self, file: &str) -> String {
        std::fs::read_to_string(self.dir.join(file)).unwrap_or_default()
    }

    fn wait_for_log(&self, file: &str, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.log(file).contains(needle) {
            assert!(Instant::now() < deadline, "{file} never contained {needle:?}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(&self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn terminate(&mut self) -> ExitStatus {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(self.child.id().to_string())
            .status()
            .unwrap();
        assert!(status.success());

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "server did not exit");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn read_reply(stream: &mut TcpStream) -> String {
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    reply
}

#[test]
fn test_process_worker_exchange() {
    let mut server = ServerProcess::start("process-exchange", "drain", 0);

    let mut client = server.connect();
    client
        .write_all("иван петров сидоров привет мир".as_bytes())
        .unwrap();
    assert_eq!(
        read_reply(&mut client),
        "сидороВ петроВ иваН Server written by X привет мир"
    );

    // the worker logs into the server's activity file
    server.wait_for_log("log_file.txt", "message received from client");

    // a worker that fails reports on stderr; the server forwards the line
    drop(server.connect());
    server.wait_for_log("error_log_file.txt", "worker: Error: Closed");

    assert!(server.terminate().success());
}

#[test]
fn test_immediate_shutdown_leaves_process_worker_running() {
    let mut server = ServerProcess::start("immediate-shutdown", "immediate", 1);

    let mut client = server.connect();
    client.write_all(b"a b c").unwrap();
    server.wait_for_log("log_file.txt", "message received from client");

    // the server exits while the worker is still sleeping
    assert!(server.terminate().success());

    assert_eq!(read_reply(&mut client), "C B A Server written by X");
}
