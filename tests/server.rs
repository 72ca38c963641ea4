mod support;

use std::{path::Path, sync::Arc, time::Duration};

use support::{EchoCompiler, GatedCompiler, PanickyCompiler, settings, start, wait_until};
use tempfile::TempDir;
use tokio::{
   io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
   net::TcpStream,
   time,
};
use warmc::{
   client::Client,
   compiler::{CompileResult, Compiler, LogLevel},
   config::ClientSettings,
   portfile::{PortFile, PortFileValues},
   server::{Server, Startup, monitor},
};

fn client(path: &Path) -> Client {
   Client::new(Arc::new(PortFile::new(path)), ClientSettings::default())
}

async fn compile(path: &Path, args: &[&str]) -> (CompileResult, Vec<(LogLevel, String)>) {
   let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
   let mut logs = Vec::new();
   let result = client(path)
      .compile(&args, |level, message| logs.push((level, message.to_string())))
      .await
      .expect("compile request");
   (result, logs)
}

async fn port_closed(port: u16) -> bool {
   !matches!(
      time::timeout(Duration::from_secs(1), TcpStream::connect(("127.0.0.1", port))).await,
      Ok(Ok(_))
   )
}

#[tokio::test(flavor = "multi_thread")]
async fn publishes_values_a_fresh_reader_can_see() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let portfile = Arc::new(PortFile::new(&path));

   let running = start(settings(&path), Arc::new(EchoCompiler), portfile);
   let published = PortFile::new(&path).current_values().unwrap();
   assert_eq!(published, Some(running.values()));
   assert_ne!(running.port(), 0);

   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());
   assert!(tokio::task::spawn_blocking(move || shutdown.initiate("test done")).await.unwrap());
   assert_eq!(server.await.unwrap().unwrap(), 0);
   assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn only_one_of_two_racing_servers_starts() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");

   let attempts: Vec<_> = (0..2)
      .map(|_| {
         let path = path.clone();
         tokio::task::spawn_blocking(move || {
            let portfile = Arc::new(PortFile::new(&path));
            Server::new(settings(&path), Arc::new(EchoCompiler), portfile)
               .start()
               .expect("start")
         })
      })
      .collect();

   let mut winners = Vec::new();
   let mut losers = Vec::new();
   for attempt in attempts {
      match attempt.await.unwrap() {
         Startup::Listening(running) => winners.push(running),
         Startup::AlreadyRunning(values) => losers.push(values),
      }
   }
   assert_eq!(winners.len(), 1);
   assert_eq!(losers.len(), 1);

   let winner = winners.pop().unwrap();
   assert_eq!(losers[0], winner.values());
   assert_eq!(PortFile::new(&path).current_values().unwrap(), Some(winner.values()));

   let shutdown = winner.shutdown_handle();
   let server = tokio::spawn(winner.run());
   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn launch_waits_for_the_lock_off_the_runtime() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let holder = PortFile::new(&path);
   let held = holder.lock().unwrap();

   let portfile = Arc::new(PortFile::new(&path));
   let server = Server::new(settings(&path), Arc::new(EchoCompiler), portfile);
   let launch = tokio::spawn(server.launch());
   time::sleep(Duration::from_millis(200)).await;
   assert!(!launch.is_finished());
   held.unlock().unwrap();

   let startup = time::timeout(Duration::from_secs(5), launch)
      .await
      .expect("launch finished")
      .unwrap()
      .unwrap();
   let Startup::Listening(running) = startup else {
      panic!("no other server was published");
   };
   assert_eq!(PortFile::new(&path).current_values().unwrap(), Some(running.values()));

   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());
   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_shutdowns_run_once() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let port = running.port();
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let callers: Vec<_> = ["monitor", "stop"]
      .into_iter()
      .map(|reason| {
         let shutdown = Arc::clone(&shutdown);
         tokio::task::spawn_blocking(move || shutdown.initiate(reason))
      })
      .collect();
   let mut initiated = 0;
   for caller in callers {
      if caller.await.unwrap() {
         initiated += 1;
      }
   }

   assert_eq!(initiated, 1);
   assert!(!shutdown.is_accepting());
   assert!(!shutdown.initiate("late"));
   assert!(matches!(shutdown.reason().as_deref(), Some("monitor" | "stop")));

   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("accept loop stopped")
      .unwrap()
      .unwrap();
   assert!(!path.exists());
   assert!(port_closed(port).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn overwritten_port_file_stops_the_owner() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let owner = Arc::new(PortFile::new(&path));
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::clone(&owner));
   assert!(owner.still_my_values().unwrap());

   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let intruder = PortFile::new(&path);
   {
      let mut lock = intruder.lock().unwrap();
      lock.set_values(1, 7).unwrap();
      lock.unlock().unwrap();
   }
   assert!(!owner.still_my_values().unwrap());

   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("monitor stopped the server")
      .unwrap()
      .unwrap();
   assert_eq!(shutdown.reason().as_deref(), Some(monitor::REASON_STOLEN));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_marker_stops_the_server() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   PortFile::new(&path).request_stop().unwrap();

   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("monitor stopped the server")
      .unwrap()
      .unwrap();
   assert_eq!(shutdown.reason().as_deref(), Some(monitor::REASON_STOP_MARKER));
   assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_port_file_stops_the_server() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   std::fs::remove_file(&path).unwrap();

   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("monitor stopped the server")
      .unwrap()
      .unwrap();
   assert_eq!(shutdown.reason().as_deref(), Some(monitor::REASON_DELETED));
   assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_server_removes_its_port_file() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let mut settings = settings(&path);
   settings.pool_size = 1;
   settings.keepalive = Duration::from_secs(2);
   let running = start(settings, Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let port = running.port();
   let server = tokio::spawn(running.run());

   let (result, logs) = compile(&path, &["-version"]).await;
   assert_eq!(result, CompileResult::Ok);
   assert_eq!(logs, vec![(LogLevel::Info, "-version".to_string())]);

   time::sleep(Duration::from_secs(3)).await;
   assert!(!path.exists());
   assert!(port_closed(port).await);
   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("server exited")
      .unwrap()
      .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn relays_logs_and_failure_results() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let (result, logs) = compile(&path, &["fail", "Main.java"]).await;
   assert_eq!(result, CompileResult::Error);
   assert_eq!(
      logs,
      vec![
         (LogLevel::Info, "fail".to_string()),
         (LogLevel::Info, "Main.java".to_string()),
         (LogLevel::Error, "compilation failed".to_string()),
      ]
   );

   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn backend_panic_fails_only_that_request() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(PanickyCompiler), Arc::new(PortFile::new(&path)));
   let error_log = running.error_log_path().to_path_buf();
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let (result, logs) = compile(&path, &["panic"]).await;
   assert_eq!(result, CompileResult::SysErr);
   assert!(logs.contains(&(LogLevel::Warn, "about to fail".to_string())));
   let notice = logs
      .iter()
      .find(|(level, _)| *level == LogLevel::Error)
      .expect("internal error notice");
   assert!(notice.1.contains("server encountered an internal error"));
   assert!(notice.1.contains(&error_log.display().to_string()));
   assert!(std::fs::read_to_string(&error_log).unwrap().contains("backend exploded"));

   let (result, _) = compile(&path, &["-version"]).await;
   assert_eq!(result, CompileResult::Ok);

   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_bounds_concurrent_compiles() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let gated = GatedCompiler::new();
   let backend: Arc<dyn Compiler> = gated.clone();
   let running = start(settings(&path), backend, Arc::new(PortFile::new(&path)));
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let requests: Vec<_> = (0..5)
      .map(|_| {
         let path = path.clone();
         tokio::spawn(async move { compile(&path, &[]).await.0 })
      })
      .collect();

   assert!(wait_until(Duration::from_secs(5), || gated.entered() == 2).await);
   time::sleep(Duration::from_millis(200)).await;
   assert_eq!(gated.entered(), 2, "pool admitted more than its size");

   gated.release(5);
   for request in requests {
      assert_eq!(request.await.unwrap(), CompileResult::Ok);
   }
   assert_eq!(gated.max_seen(), 2);

   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_for_running_compiles() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let gated = GatedCompiler::new();
   let backend: Arc<dyn Compiler> = gated.clone();
   let running = start(settings(&path), backend, Arc::new(PortFile::new(&path)));
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let request = {
      let path = path.clone();
      tokio::spawn(async move { compile(&path, &[]).await.0 })
   };
   assert!(wait_until(Duration::from_secs(5), || gated.entered() == 1).await);

   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   time::sleep(Duration::from_millis(200)).await;
   assert!(!server.is_finished(), "server exited with a compile in flight");

   gated.release(1);
   assert_eq!(request.await.unwrap(), CompileResult::Ok);
   time::timeout(Duration::from_secs(5), server)
      .await
      .expect("server exited")
      .unwrap()
      .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_request_gets_cmderr() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let running = start(settings(&path), Arc::new(EchoCompiler), Arc::new(PortFile::new(&path)));
   let port = running.port();
   let shutdown = running.shutdown_handle();
   let server = tokio::spawn(running.run());

   let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
   stream.write_all(b"lots\n").await.unwrap();
   let mut lines = BufReader::new(stream).lines();
   let first = lines.next_line().await.unwrap().unwrap();
   assert!(first.starts_with("ERROR:bad request"), "{first}");
   assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("RC:CMDERR"));
   assert_eq!(lines.next_line().await.unwrap(), None);

   tokio::task::spawn_blocking(move || shutdown.initiate("test done"))
      .await
      .unwrap();
   server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_values_block_startup() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("server.port");
   let existing = PortFileValues { port: 1, cookie: 99 };
   std::fs::write(&path, existing.encode()).unwrap();

   let portfile = Arc::new(PortFile::new(&path));
   let startup = Server::new(settings(&path), Arc::new(EchoCompiler), portfile)
      .start()
      .unwrap();
   assert!(matches!(startup, Startup::AlreadyRunning(values) if values == existing));
   assert_eq!(PortFile::new(&path).current_values().unwrap(), Some(existing));
}
