/*
    QICTape

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

use std::path::PathBuf;

use ftape_core::{device_types::qic117::DataRate, devices::vendors::WakeupMethod};

use bpaf::Bpaf;

#[cfg_attr(feature = "use_bpaf", derive(Bpaf))]
#[cfg_attr(feature = "use_bpaf", bpaf(options, version, generate(cli_args)))]
#[derive(Debug, Default)]
pub struct CmdLineArgs {
    #[bpaf(long("config_file"), long("configfile"))]
    pub config_file: Option<PathBuf>,

    // Exercise options
    #[bpaf(long("start_segment"), long("start"))]
    pub start_segment: Option<u32>,
    #[bpaf(long)]
    pub segments: Option<u32>,
    #[bpaf(long("file_marks"), long("filemarks"))]
    pub file_marks: Option<u32>,
    #[bpaf(long("crc_faults"))]
    pub crc_faults: Option<u32>,

    // Session options
    #[bpaf(long("data_rate"), long("rate"))]
    pub data_rate: Option<DataRate>,
    #[bpaf(long("no_read_ahead"), switch)]
    pub no_read_ahead: bool,

    // Simulated drive options
    #[bpaf(long)]
    pub wakeup: Option<WakeupMethod>,
    #[bpaf(long)]
    pub seed: Option<u64>,
    #[bpaf(long("skip_bias"))]
    pub skip_bias: Option<i32>,
    #[bpaf(long("write_protect"), switch)]
    pub write_protect: bool,
}
