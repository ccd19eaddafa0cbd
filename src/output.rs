//! Framed console summaries for the command surface.

pub const DEFAULT_WIDTH: usize = 80;

pub fn print_separator(ch: char, width: usize) {
    println!("{}", ch.to_string().repeat(width));
}

pub fn print_header(title: &str, width: usize) {
    println!();
    print_separator('=', width);
    println!("{title}");
    print_separator('=', width);
}

pub fn print_footer(message: &str, width: usize) {
    println!();
    print_separator('=', width);
    println!("{message}");
    print_separator('=', width);
    println!();
}
