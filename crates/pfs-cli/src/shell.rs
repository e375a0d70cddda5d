//! Interactive command shell.
//!
//! Reads one command per line, runs it against an [`Fs`] and writes the
//! result. Filesystem errors are printed and the loop continues; only I/O
//! errors on the shell's own input or output end it.

use pfs::{ByteDevice, DirEntry, Fs, MetadataStore, NodeKind, PfsError};
use std::io::{self, BufRead, Write};
use thiserror::Error;

pub const PROMPT: &str = "packfs$ ";

const HELP: &str = "\
commands:
  ls [dir...]        list directories (default /)
  cat <path>         print a file
  touch <path...>    create empty files
  mkdir <path...>    create directories
  edit <path>        replace a file with the next input line
  rm <path...>       remove files
  rmdir <path...>    remove directories and everything below them
  stat <path>        show kind, size and extent
  df                 show space usage
  help               show this text
  exit               leave the shell";

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Fs(#[from] PfsError),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Flow {
    Continue,
    Exit,
}

pub struct Shell<'a, D: ByteDevice, M: MetadataStore, R, W> {
    fs: &'a mut Fs<D, M>,
    input: R,
    output: W,
}

impl<'a, D, M, R, W> Shell<'a, D, M, R, W>
where
    D: ByteDevice,
    M: MetadataStore,
    R: BufRead,
    W: Write,
{
    pub fn new(fs: &'a mut Fs<D, M>, input: R, output: W) -> Self {
        Self { fs, input, output }
    }

    /// Run until `exit` or end of input.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            write!(self.output, "{PROMPT}")?;
            self.output.flush()?;
            let Some(line) = self.read_line()? else {
                writeln!(self.output)?;
                return Ok(());
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            let Some((command, args)) = words.split_first() else {
                continue;
            };
            match self.dispatch(command, args) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return Ok(()),
                Err(CommandError::Io(err)) => return Err(err),
                Err(err) => writeln!(self.output, "{err}")?,
            }
        }
    }

    /// Next input line without its terminator; `None` at end of input.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    fn dispatch(&mut self, command: &str, args: &[&str]) -> Result<Flow, CommandError> {
        match command {
            "ls" => self.ls(args)?,
            "cat" => {
                let [path] = args else {
                    return Err(CommandError::Usage("cat <path>"));
                };
                let content = self.fs.get_content(path)?;
                self.output.write_all(&content)?;
                writeln!(self.output)?;
            }
            "touch" => self.create_each(args, NodeKind::File, "touch <path...>")?,
            "mkdir" => self.create_each(args, NodeKind::Directory, "mkdir <path...>")?,
            "edit" => {
                let [path] = args else {
                    return Err(CommandError::Usage("edit <path>"));
                };
                let Some(content) = self.read_line()? else {
                    return Err(CommandError::Usage("edit <path>, then the content on the next line"));
                };
                self.fs.set_content(path, content.as_bytes())?;
            }
            "rm" => {
                if args.is_empty() {
                    return Err(CommandError::Usage("rm <path...>"));
                }
                for path in args {
                    self.fs.remove_file(path)?;
                }
            }
            "rmdir" => {
                if args.is_empty() {
                    return Err(CommandError::Usage("rmdir <path...>"));
                }
                for path in args {
                    self.fs.remove_dir(path)?;
                }
            }
            "stat" => {
                let [path] = args else {
                    return Err(CommandError::Usage("stat <path>"));
                };
                let stat = self.fs.stat(path)?;
                writeln!(self.output, "path: {}", stat.path)?;
                writeln!(self.output, "kind: {}", stat.kind)?;
                if let Some(size) = stat.size {
                    writeln!(self.output, "size: {size}")?;
                }
                match stat.extent {
                    Some(extent) => writeln!(self.output, "extent: {extent}")?,
                    None => writeln!(self.output, "extent: none")?,
                }
            }
            "df" => {
                let usage = self.fs.usage();
                writeln!(self.output, "capacity: {}", usage.capacity)?;
                writeln!(self.output, "used: {}", usage.used_bytes)?;
                writeln!(self.output, "free: {}", usage.free_bytes)?;
                writeln!(self.output, "high_water_mark: {}", usage.high_water_mark)?;
                writeln!(self.output, "files: {}", usage.files)?;
                writeln!(self.output, "directories: {}", usage.directories)?;
            }
            "help" => writeln!(self.output, "{HELP}")?,
            "exit" => return Ok(Flow::Exit),
            other => return Err(CommandError::Unknown(other.to_owned())),
        }
        Ok(Flow::Continue)
    }

    fn ls(&mut self, args: &[&str]) -> Result<(), CommandError> {
        let dirs: &[&str] = if args.is_empty() { &["/"] } else { args };
        for (i, dir) in dirs.iter().enumerate() {
            let entries = self.fs.list(dir)?;
            if dirs.len() > 1 {
                if i > 0 {
                    writeln!(self.output)?;
                }
                writeln!(self.output, "{dir}:")?;
            }
            for entry in &entries {
                self.write_entry(entry)?;
            }
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &DirEntry) -> io::Result<()> {
        match entry.kind {
            NodeKind::Directory => writeln!(self.output, "{}/", entry.name),
            NodeKind::File => writeln!(self.output, "{}\t{}", entry.name, entry.size.unwrap_or(0)),
        }
    }

    fn create_each(
        &mut self,
        args: &[&str],
        kind: NodeKind,
        usage: &'static str,
    ) -> Result<(), CommandError> {
        if args.is_empty() {
            return Err(CommandError::Usage(usage));
        }
        for path in args {
            self.fs.create(path, kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs::{FsConfig, MemByteDevice, MemoryMetadataStore};

    fn session(script: &str) -> (String, Fs<MemByteDevice, MemoryMetadataStore>) {
        let mut fs = Fs::open(
            MemByteDevice::new(100),
            MemoryMetadataStore::new(),
            FsConfig::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        Shell::new(&mut fs, script.as_bytes(), &mut out).run().unwrap();
        (String::from_utf8(out).unwrap(), fs)
    }

    fn without_prompts(out: &str) -> String {
        out.replace(PROMPT, "")
    }

    #[test]
    fn edit_then_cat_prints_content() {
        let (out, fs) = session("touch /a\nedit /a\nhello world\ncat /a\nexit\n");
        assert_eq!(without_prompts(&out), "hello world\n");
        assert_eq!(fs.get_content("/a").unwrap(), b"hello world");
    }

    #[test]
    fn ls_marks_directories_and_sizes() {
        let (out, _) = session("mkdir /d\ntouch /f /d/g\nedit /f\nabc\nls\nls /d\n");
        assert_eq!(without_prompts(&out), "d/\nf\t3\ng\t0\n\n");
    }

    #[test]
    fn ls_with_several_dirs_prints_headers() {
        let (out, _) = session("mkdir /x /y\ntouch /x/a\nls /x /y\nexit\n");
        assert_eq!(without_prompts(&out), "/x:\na\t0\n\n/y:\n");
    }

    #[test]
    fn errors_are_printed_and_the_loop_continues() {
        let (out, fs) = session("cat /missing\nbogus arg\ntouch /ok\nexit\n");
        let out = without_prompts(&out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "not found: /missing");
        assert_eq!(lines[1], "unknown command: bogus");
        assert!(fs.stat("/ok").is_ok());
    }

    #[test]
    fn blank_lines_are_ignored_and_eof_exits() {
        let (out, _) = session("\n   \ntouch /a");
        assert_eq!(out.matches(PROMPT).count(), 4);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn multi_path_commands_stop_at_first_error() {
        let (out, fs) = session("touch /a /missing/b /c\nexit\n");
        assert!(without_prompts(&out).starts_with("not found: /missing/b"));
        assert!(fs.stat("/a").is_ok());
        assert!(fs.stat("/c").is_err());
    }

    #[test]
    fn rm_and_rmdir() {
        let (_, fs) = session("mkdir /d\ntouch /d/a /b\nedit /d/a\naaa\nedit /b\nbb\nrmdir /d\nrm /b\nexit\n");
        assert!(fs.list("/").unwrap().is_empty());
        assert_eq!(fs.usage().used_bytes, 0);
    }

    #[test]
    fn stat_and_df_report_placement() {
        let (out, _) = session("touch /a\nedit /a\nhello\nstat /a\ndf\nexit\n");
        let out = without_prompts(&out);
        assert!(out.contains("kind: file\nsize: 5\nextent: [6, 10]\n"));
        assert!(out.contains("capacity: 100\nused: 5\nfree: 89\nhigh_water_mark: 10\n"));
    }

    #[test]
    fn only_exit_leaves_the_shell() {
        let (out, fs) = session("quit\ntouch /after\nexit\ntouch /never\n");
        let out = without_prompts(&out);
        assert_eq!(out.lines().next(), Some("unknown command: quit"));
        assert!(fs.stat("/after").is_ok());
        assert!(fs.stat("/never").is_err());
    }

    #[test]
    fn missing_arguments_print_usage() {
        let (out, _) = session("cat\nrm\nexit\n");
        let out = without_prompts(&out);
        assert!(out.contains("usage: cat <path>"));
        assert!(out.contains("usage: rm <path...>"));
    }
}
