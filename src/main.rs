fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = psu_bench::cli::parse_args();

    match psu_bench::cli::run(&matches) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("Error: {err:#}");
            std::process::exit(2);
        }
    }
}
