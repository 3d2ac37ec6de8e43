//! Outbound message texts (pt-BR)

use crate::models::{Medication, Patient, ReplyCode};

pub const OPT_OUT_KEYWORD: &str = "sair";

pub fn reminder(patient: &Patient, medication: &Medication, postpone_minutes: i64) -> String {
    format!(
        "Olá, {}! 💊 Está na hora do seu remédio: *{}* ({}).\n\n\
         Responda com:\n\
         1 - Já tomei\n\
         2 - Não vou tomar\n\
         3 - Me lembre em {} minutos",
        first_name(&patient.name),
        medication.name,
        medication.dosage,
        postpone_minutes
    )
}

pub fn confirmation(code: ReplyCode, postpone_minutes: i64) -> String {
    match code {
        ReplyCode::Taken => "Ótimo! ✅ Registramos que você tomou seu remédio.".to_string(),
        ReplyCode::NotTaken => {
            "Tudo bem, registramos que você não tomou o remédio. Se precisar, fale com quem cuida de você."
                .to_string()
        }
        ReplyCode::Postpone => format!(
            "Combinado! ⏰ Vamos lembrar você de novo em {} minutos.",
            postpone_minutes
        ),
    }
}

pub fn opt_out() -> String {
    "Você não vai mais receber lembretes. Para voltar, fale com quem cuida de você.".to_string()
}

pub fn help() -> String {
    "Desculpe, não entendi. Responda com:\n\
     1 - Já tomei\n\
     2 - Não vou tomar\n\
     3 - Me lembre mais tarde\n\
     SAIR - Parar de receber lembretes"
        .to_string()
}

fn first_name(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or(name)
}
