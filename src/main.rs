use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    chatpipe::cli::main()
}
