use tokio::runtime::Builder;

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {} <config filename>", arg0);
    std::process::exit(1);
}

fn main() {
    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    if args.len() != 1 {
        eprintln!("Expected exactly one config file.");
        print_usage_and_exit(arg0);
        return;
    }

    let config = match moongate::config::load_config(&args[0]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}\n");
            print_usage_and_exit(arg0);
            return;
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = config.log_level.as_deref() {
        builder.parse_filters(level);
    }
    builder.init();

    // All session state is single-writer by design; one I/O thread is all
    // the proxy needs.
    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    if let Err(e) = runtime.block_on(moongate::server::run(config)) {
        eprintln!("Fatal: {e}");
        std::process::exit(1);
    }
}
