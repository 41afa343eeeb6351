//! Interactive yes/no confirmation

use std::io::{self, BufRead, Write};

/// Ask `question` until the answer is yes or no
///
/// Accepts `y`, `yes`, `n` and `no` in any case. End of input counts as no.
pub fn confirm<R, W>(question: &str, input: &mut R, output: &mut W) -> io::Result<bool>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, "{} [y/n] ", question)?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(false);
        }

        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(output, "Please answer yes or no.")?,
        }
    }
}

/// [`confirm`] on stdin/stdout, or `true` without asking when `assume_yes`
pub fn confirm_stdio(question: &str, assume_yes: bool) -> io::Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    confirm(question, &mut io::stdin().lock(), &mut io::stdout().lock())
}
