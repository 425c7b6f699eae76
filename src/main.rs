use stress_test::{stress_test_convergence, stress_test_scaling};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Test 1: Small scale
    let stats = stress_test_convergence(4, 100, 200).await?;
    stats.print();
    converged &= stats.converged;

    // Test 2: Medium scale
    let stats = stress_test_convergence(10, 500, 1000).await?;
    stats.print();
    converged &= stats.converged;

    // Test 3: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    converged &= stress_test_scaling(20, 4).await?;

    if !converged {
        return Err("clients diverged from the hub".into());
    }
    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
