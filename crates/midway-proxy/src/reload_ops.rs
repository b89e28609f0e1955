/// Parses a suffix list file: one domain suffix per line, blank lines and
/// `#` comments ignored.
pub fn load_suffix_file(path: &str) -> io::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn reload_policy<S>(runtime: &RuntimeHandles<S>) -> io::Result<u64>
where
    S: EventSink + Send + Sync + 'static,
{
    let Some(path) = runtime.config.suffix_file.as_deref() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no suffix_file configured",
        ));
    };
    let suffixes = load_suffix_file(path)?;
    let count = suffixes.len();
    let generation = runtime.core.router().reload(suffixes);
    runtime.core.emit(
        Event::new(EventKind::PolicyReloaded, policy_context())
            .with_attribute("generation", generation.to_string())
            .with_attribute("suffix_count", count.to_string()),
    );
    Ok(generation)
}

fn policy_context() -> SessionContext {
    SessionContext {
        session_id: 0,
        client_addr: "<policy>".to_string(),
        server_host: String::new(),
        server_port: 0,
    }
}
