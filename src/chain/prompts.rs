use crate::question::Language;

pub const CONTEXTUALIZE: &str = r#"Given the following conversation and a follow-up question, rephrase the follow-up question to be a standalone question in its original language.
Keep regulation numbers, names and any foreign-language terms exactly as written.
If the chat history is not relevant to the follow-up question, ignore the chat history.
If the follow-up question is already standalone, return it unchanged.
Return only the standalone question.

Chat History:
{chat_history}

Follow-up Question: {question}
Standalone Question:"#;

pub const ROUTER: &str = r#"You are an expert at routing a user question to the appropriate data source.

IF the user asks WHETHER A REGULATION HAS BEEN REVOKED, AMENDED OR IS STILL VALID:
Criteria: the question asks about the validity, modification or history of a regulation (e.g. "Is regulation XXX still valid?", "Has this rule been modified?", "Apakah peraturan xxx masih berlaku?", or anything about "rekam jejak").
Action: return rekam_jejak

ELSE IF the user asks for an explanation or the content of regulations:
Criteria: the question asks what a regulation says or means, regulatory concerns, or anything unrelated to "rekam jejak".
Action: return ketentuan_terkait

MOST QUESTIONS ARE ketentuan_terkait. If you are unsure, return ketentuan_terkait.

Reply with exactly one label: rekam_jejak or ketentuan_terkait.

Question: {question}
Label:"#;

pub const RESPONSIVENESS: &str = r#"You are judging an assistant's response. Determine if the response answers the question.
A response that says the information is not available, or only talks around the question, does NOT answer it.
Reply with exactly YES or NO.

Question: {question}

Response: {answer}

Does the response answer the question? (YES/NO):"#;

pub const QUERY_CONSTRUCTOR: &str = r#"Your goal is to structure the user's query to match the request schema below.

The documents are described as: {content}

Filterable attributes:
{attributes}

Return a JSON object of the form:
{"query": "<text to look up in the document contents>", "filter": <filter or "NO_FILTER">}

A filter is either a comparison
{"op": "eq" | "ne" | "gt" | "gte" | "lt" | "lte" | "contain", "attribute": "<attribute>", "value": <string or number>}
or a logical operation
{"op": "and" | "or" | "not", "args": [<filter>, ...]}

Rules:
- Use only the attributes listed above.
- Dates must be written as YYYY/MM/DD.
- Remove from the query any words already expressed by the filter.
- If no filter applies, use "NO_FILTER".

User Query: {question}
Structured Request:"#;

/// Two placeholders: `{language}` and `{identifier_hint}` describe the
/// answer language and the corpus' identifier field.
pub const QA: &str = r#"You are an assistant for question-answering tasks on Indonesian financial regulations. Use the context provided to answer the question. Follow these guidelines:

1. Language: respond in {language}, the language of the question.
2. Regulation references: when the question relates to regulations, name the regulation numbers ({identifier_hint}) and explain their content.
3. Context relevance:
   - Do not answer from your own knowledge.
   - Even if the context is only slightly related, always mention every relevant regulation number found in it.
   - If nothing in the context is relevant, say so explicitly.
4. Sources: list all unique regulation numbers you used, each formatted as [regulation_number](file_url) using only URLs present in the context. Append #page=N to the URL when the context gives a page number for a PDF.

Question: {question}

Context:
{context}

Answer:"#;

pub const GRAPH_SCHEMA: &str = r#"Node properties:
Peraturan {nomor_ketentuan: STRING, judul_ketentuan: STRING, jenis_ketentuan: STRING, tanggal_ketentuan: STRING, kodifikasi_ketentuan: STRING, file_url: STRING}
Relationship types:
(:Peraturan)-[:DICABUT]->(:Peraturan)   the source regulation is revoked by the target
(:Peraturan)-[:DIUBAH]->(:Peraturan)    the source regulation is amended by the target
(:Peraturan)-[:MENCABUT]->(:Peraturan)  the source regulation revokes the target
(:Peraturan)-[:MENGUBAH]->(:Peraturan)  the source regulation amends the target"#;

pub const GRAPH_CYPHER: &str = r#"Task: generate a Cypher statement to query a graph database.
Instructions:
Use only the relationship types and properties in the schema.
Do not use any other relationship types or properties.
The statement must be read-only.
Schema:
{schema}
Do not include any explanations or apologies. Do not answer anything other than constructing a Cypher statement.
Return only the Cypher statement inside a ```cypher code block.
Jika pengguna menanyakan apakah suatu peraturan masih berlaku, periksa apakah peraturan tersebut telah DICABUT atau DIUBAH oleh peraturan lain, atau apakah peraturan lain MENCABUT atau MENGUBAH peraturan tersebut.

Example (for reasoning only, never copy its values):
Question: Apakah peraturan dengan nomor XXXX masih berlaku?
```cypher
MATCH (p:Peraturan {nomor_ketentuan: 'XXXX'})
OPTIONAL MATCH (p)<-[:MENCABUT|MENGUBAH]-(other:Peraturan)
OPTIONAL MATCH (p)-[:DICABUT|DIUBAH]->(newer:Peraturan)
RETURN p.nomor_ketentuan AS peraturan,
  other.nomor_ketentuan AS dicabut_atau_diubah_oleh,
  newer.nomor_ketentuan AS digantikan_oleh
```

Question: {question}"#;

pub const GRAPH_QA: &str = r#"You turn the results of a Neo4j Cypher query into a human-readable answer.
The query results were produced from the user's question and are authoritative. Do not doubt them or correct them with your own knowledge.

Question:
{question}

Query results:
{context}

If a regulation is revoked (DICABUT), amended (DIUBAH), or revokes (MENCABUT) or amends (MENGUBAH) another, state it and name every related regulation number as evidence.
Never say you lack information when the results contain data.
Write the answer in {language}."#;

/// Structured (graph) and unstructured (documents) context for the
/// validity path, graph first.
pub const RECORD_TRACK_CONTEXT: &str = r#"You are given two sources of context: a knowledge-graph answer and a list of retrieved documents.
Prioritise the knowledge-graph answer when it is not empty. If it is empty, rely fully on the documents.
If the knowledge-graph answer covers the topic but misses details, supplement it from the documents.

Knowledge-graph answer:
{structured}

Documents:
{unstructured}"#;

pub fn fallback_answer(language: Language) -> &'static str {
    match language {
        Language::Indonesian => {
            "Maaf, saya tidak dapat menemukan jawaban atas pertanyaan Anda pada sumber regulasi yang tersedia."
        }
        Language::English => {
            "Sorry, I could not find an answer to your question in the available regulatory sources."
        }
    }
}

pub fn not_found_answer(language: Language) -> &'static str {
    match language {
        Language::Indonesian => "Informasi yang relevan tidak ditemukan dalam konteks yang tersedia.",
        Language::English => "No relevant information was found in the provided context.",
    }
}

pub fn graph_unknown_answer(language: Language) -> &'static str {
    match language {
        Language::Indonesian => "Saya tidak tahu jawabannya; tidak ada data rekam jejak untuk peraturan tersebut.",
        Language::English => "I don't know the answer; there is no record-track data for that regulation.",
    }
}

/// Heading for the revoking/amending regulations appended when the graph
/// answer leaves them out.
pub fn related_heading(language: Language) -> &'static str {
    match language {
        Language::Indonesian => "Peraturan terkait (mencabut/mengubah)",
        Language::English => "Related regulations (revoking/amending)",
    }
}
