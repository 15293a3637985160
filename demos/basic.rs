//! Basic usage of the connection managers with an in-memory connection

use esox_connection_manager::{
    BasicConnectionManager, ConnectionFactory, ConnectionHandle, ConnectionIdentity,
    ConnectionKind, ConnectionManager, ConnectionResult, ExecutionContextId,
    ManagerConfiguration, PooledConnectionManager,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Pretends to be a remote session
struct InMemoryConnection {
    kind: ConnectionKind,
    open: AtomicBool,
}

impl InMemoryConnection {
    fn factory() -> ConnectionFactory {
        ConnectionFactory::new()
            .with_constructor(ConnectionKind::Sftp, || Self::handle(ConnectionKind::Sftp))
            .with_constructor(ConnectionKind::Shell, || Self::handle(ConnectionKind::Shell))
    }

    fn handle(kind: ConnectionKind) -> Arc<dyn ConnectionHandle> {
        Arc::new(Self {
            kind,
            open: AtomicBool::new(false),
        })
    }
}

impl ConnectionHandle for InMemoryConnection {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    fn connect(&self, identity: &ConnectionIdentity, _timeout: Duration) -> ConnectionResult<()> {
        println!("   [connect {} {}]", self.kind, identity);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> ConnectionResult<()> {
        println!("   [disconnect {}]", self.kind);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }
}

fn main() -> ConnectionResult<()> {
    println!("=== Esox Connection Manager - Basic Examples ===\n");

    let identity = ConnectionIdentity::new("127.0.0.1", 2222, "test", "test");

    // Example 1: Reuse on the same thread
    reuse(&identity)?;

    // Example 2: Idle connection taken over by another context
    take_over(&identity)?;

    // Example 3: Timeouts handled by the scheduled inspection
    scheduled_inspection(&identity)?;

    // Example 4: Pooled manager
    pooled(&identity)?;

    Ok(())
}

fn reuse(identity: &ConnectionIdentity) -> ConnectionResult<()> {
    println!("1. Reuse:");
    let manager = BasicConnectionManager::new(InMemoryConnection::factory(), ManagerConfiguration::default());

    let first = manager.borrow_connection(identity, ConnectionKind::Sftp)?;
    manager.release_connection(identity);
    let second = manager.borrow_connection(identity, ConnectionKind::Sftp)?;
    println!("   Same connection: {}", Arc::ptr_eq(&first, &second));

    manager.close_connection(identity);
    let third = manager.borrow_connection(identity, ConnectionKind::Sftp)?;
    println!("   After close, same connection: {}\n", Arc::ptr_eq(&first, &third));
    Ok(())
}

fn take_over(identity: &ConnectionIdentity) -> ConnectionResult<()> {
    println!("2. Take over:");
    let manager = BasicConnectionManager::new(
        InMemoryConnection::factory(),
        ManagerConfiguration::new().with_max_connection_size(1),
    );
    let worker_a = ExecutionContextId::allocate();
    let worker_b = ExecutionContextId::allocate();

    let held = manager.borrow_connection_for(worker_a, identity, ConnectionKind::Sftp)?;
    match manager.borrow_connection_for(worker_b, identity, ConnectionKind::Sftp) {
        Ok(_) => println!("   Unexpected second connection"),
        Err(e) => println!("   While {} holds it: {}", worker_a, e),
    }

    manager.release_connection_for(worker_a, identity);
    let taken = manager.borrow_connection_for(worker_b, identity, ConnectionKind::Sftp)?;
    println!("   {} got {}'s connection: {}", worker_b, worker_a, Arc::ptr_eq(&held, &taken));
    println!("   Metrics: {:?}\n", manager.get_metrics());
    Ok(())
}

fn scheduled_inspection(identity: &ConnectionIdentity) -> ConnectionResult<()> {
    println!("3. Scheduled inspection:");
    let config = ManagerConfiguration::new()
        .with_borrow_timeout(Duration::from_millis(50))
        .with_idle_timeout(Duration::from_millis(150))
        .with_schedule_period(Duration::from_millis(25));
    let manager = BasicConnectionManager::new(InMemoryConnection::factory(), config);

    manager.borrow_connection(identity, ConnectionKind::Shell)?;
    std::thread::sleep(Duration::from_millis(100));
    let slot = manager.registry().slot(identity, ExecutionContextId::current());
    println!(
        "   Forgotten borrow released: {}",
        slot.is_some_and(|slot| !slot.is_borrowed())
    );

    std::thread::sleep(Duration::from_millis(250));
    println!("   Idle connection closed: {}", manager.registry().total_slots() == 0);

    let health = manager.get_health_status();
    println!("   Healthy: {} ({} warnings)\n", health.is_healthy(), health.warning_count);
    Ok(())
}

fn pooled(identity: &ConnectionIdentity) -> ConnectionResult<()> {
    println!("4. Pooled:");
    let manager = PooledConnectionManager::new(
        InMemoryConnection::factory(),
        ManagerConfiguration::new()
            .with_max_connection_size(1)
            .with_borrow_max_wait(Duration::from_millis(100)),
    );

    {
        let connection = manager.borrow_connection(identity, ConnectionKind::Sftp)?;
        println!("   Borrowed pooled connection #{}", connection.id());
        match manager.borrow_connection(identity, ConnectionKind::Sftp) {
            Ok(_) => println!("   Unexpected second connection"),
            Err(e) => println!("   Pool exhausted: {}", e),
        }
        // Returned to the pool here
    }

    let again = manager.borrow_connection(identity, ConnectionKind::Sftp)?;
    println!("   Borrowed again #{}", again.id());
    println!("   Pools: {:?}", manager.directory().statistics());
    Ok(())
}
