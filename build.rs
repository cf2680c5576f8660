fn main() {
    use vergen::{BuildBuilder, Emitter};

    // Only VERGEN_BUILD_TIMESTAMP is read, by the startup log line.
    let build = match BuildBuilder::default().build_timestamp(true).build() {
        Ok(build) => build,
        Err(e) => {
            eprintln!("build timestamp skipped: {e}");
            return;
        }
    };

    let mut emitter = Emitter::default();
    if let Err(e) = emitter.add_instructions(&build) {
        eprintln!("build timestamp skipped: {e}");
        return;
    }
    if let Err(e) = emitter.emit() {
        eprintln!("vergen emit skipped: {e}");
    }
}
