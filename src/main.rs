fn main() {
    if let Err(err) = ibl_viewer::run() {
        eprintln!("Application error: {err}");
        std::process::exit(1);
    }
}
