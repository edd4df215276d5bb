use localci_proto::agent::{self, command::Instruction as ProtoInstruction};

use crate::build::{Command, Instruction};

pub fn to_proto_command(command: &Command) -> agent::Command {
    let instruction = match &command.instruction {
        Instruction::Clone => ProtoInstruction::CloneInstruction(agent::CloneInstruction {}),
        Instruction::Script { scripts } => {
            ProtoInstruction::ScriptInstruction(agent::ScriptInstruction {
                scripts: scripts.clone(),
            })
        }
        Instruction::BackgroundScript { scripts } => {
            ProtoInstruction::BackgroundScriptInstruction(agent::BackgroundScriptInstruction {
                scripts: scripts.clone(),
            })
        }
        Instruction::Cache {
            folder,
            fingerprint_scripts,
            populate_scripts,
        } => ProtoInstruction::CacheInstruction(agent::CacheInstruction {
            folder: folder.clone(),
            fingerprint_scripts: fingerprint_scripts.clone(),
            populate_scripts: populate_scripts.clone(),
        }),
        Instruction::UploadCache { cache_name } => {
            ProtoInstruction::UploadCacheInstruction(agent::UploadCacheInstruction {
                cache_name: cache_name.clone(),
            })
        }
        Instruction::Artifacts { paths } => {
            ProtoInstruction::ArtifactsInstruction(agent::ArtifactsInstruction {
                paths: paths.clone(),
            })
        }
    };

    agent::Command {
        name: command.name.clone(),
        instruction: Some(instruction),
        properties: command.properties.clone(),
    }
}
