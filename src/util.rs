const NATS_URL: &str = "FLEETWATCH_NATS_URL";

pub fn get_nats_url() -> Option<String> {
    std::env::var(NATS_URL).ok().filter(|url| !url.is_empty())
}

const WORKERS: &str = "FLEETWATCH_WORKERS";

pub fn get_worker_count() -> Option<usize> {
    let workers_from_env = std::env::var(WORKERS);
    workers_from_env
        .ok()
        .and_then(|res| res.parse().ok())
        .filter(|count| *count > 0)
}
