// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/camd.proto")?;
    tonic_build::compile_protos("proto/pipeline.proto")?;
    Ok(())
}
